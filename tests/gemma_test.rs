//! The candle pipeline up to the point where real weights would be needed.

use std::sync::Arc;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use whisperer::backend::{Backend, Outbox};
use whisperer::backend::fetch::ModelFetcher;
use whisperer::backend::gemma::{GemmaPipeline, format_prompt};
use whisperer::backend::pipeline::PipelineBackend;
use whisperer::catalog::LazyCatalog;
use whisperer::chat_state::ChatState;
use whisperer::error::BridgeError;
use whisperer::prompts::build_messages;
use whisperer::protocol::Reply;
use whisperer::relay::{Relay, SinkRegistry};
use whisperer::session::{Session, SessionState};

async fn serve(server: &MockServer, name: &str, status: u16, body: &'static str) {
    Mock::given(method("GET"))
        .and(path(format!("/{name}")))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn missing_tokenizer_fails_load_after_fetching_config() {
    let server = MockServer::start().await;
    serve(&server, "config.json", 200, "{}").await;
    serve(&server, "tokenizer.json", 404, "").await;
    let dir = tempfile::tempdir().unwrap();

    let pipeline = GemmaPipeline::new(ModelFetcher::new(server.uri(), dir.path()));
    let backend = Arc::new(PipelineBackend::new("gemma-3-270m-it", pipeline));
    let chat = Arc::new(ChatState::new());
    let registry = Arc::new(SinkRegistry::new());
    registry.register(chat.clone());
    let session = Session::new(backend.clone(), Relay::new(registry), LazyCatalog::disabled());

    let err = session.load().await.unwrap_err();
    assert!(matches!(err, BridgeError::BackendFault(ref m) if m.contains("tokenizer.json")));
    assert!(matches!(session.state(), SessionState::Failed(_)));
    assert!(!backend.is_loaded());
    assert!(dir.path().join("config.json").exists());
    assert!(!dir.path().join("model.safetensors").exists());

    let snapshot = chat.snapshot();
    assert!(!snapshot.model_loaded);
    assert!(snapshot.loading_progress.starts_with("Error: "));
}

#[tokio::test]
async fn unreadable_config_fails_after_every_file_is_fetched() {
    let server = MockServer::start().await;
    serve(&server, "config.json", 200, "not json").await;
    serve(&server, "tokenizer.json", 200, "{}").await;
    serve(&server, "model.safetensors", 200, "weights").await;
    let dir = tempfile::tempdir().unwrap();

    let backend = PipelineBackend::new(
        "gemma-3-270m-it",
        GemmaPipeline::new(ModelFetcher::new(server.uri(), dir.path())),
    );
    let (outbox, mut rx) = Outbox::channel();
    assert!(backend.load(&outbox).await.is_err());
    assert!(!backend.is_loaded());
    assert!(!backend.pipeline().is_loaded());

    let mut done = Vec::new();
    while let Ok(reply) = rx.try_recv() {
        if let Reply::Done { file } = reply {
            done.push(file);
        }
    }
    assert_eq!(done, vec!["config.json", "tokenizer.json", "model.safetensors"]);
}

#[test]
fn session_prompt_renders_as_one_user_turn() {
    let prompt = format_prompt(&build_messages("", "When do I repot a fern?"));
    assert!(prompt.starts_with("<bos><start_of_turn>user\nYou are Gemma"));
    assert!(prompt.contains("\n\nWhen do I repot a fern?<end_of_turn>\n"));
    assert_eq!(prompt.matches("<start_of_turn>").count(), 2);
}
