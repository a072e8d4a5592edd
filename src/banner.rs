//! Startup banner and session summary display.

use crate::consts::{AUTHOR, HOMEPAGE, REPO};

/// Session configuration for display in the startup banner.
pub struct BannerInfo<'a> {
    pub backend: &'a str,
    pub model: &'a str,
    pub endpoint: Option<&'a str>,
    pub catalog: &'a str,
    pub settings: &'a str,
}

/// Print the startup banner with session info.
pub fn print_banner(info: &BannerInfo) {
    println!(
        r#"
   ╔═══════════════════════════════════════╗
   ║         W H I S P E R E R             ║
   ║   Heartyculture's plant assistant     ║
   ╚═══════════════════════════════════════╝

   version   {}
   by        {}
   home      {}
   repo      {}
   backend   {} ({})
   endpoint  {}
   catalog   {}
   settings  {}
"#,
        env!("CARGO_PKG_VERSION"),
        AUTHOR,
        HOMEPAGE,
        REPO,
        info.backend,
        info.model,
        info.endpoint.unwrap_or("-"),
        info.catalog,
        info.settings,
    );
}

/// Print the last generation's stats and a farewell.
pub fn print_session_summary(num_tokens: u64, tps: f64) {
    if num_tokens > 0 {
        println!("last reply: {num_tokens} tokens at {tps:.1} tok/s");
    }
    println!("goodbye.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_banner_does_not_panic() {
        let info = BannerInfo {
            backend: "scripted",
            model: "demo",
            endpoint: None,
            catalog: "none",
            settings: ":memory:",
        };
        // Just verify it doesn't panic
        print_banner(&info);
    }

    #[test]
    fn print_session_summary_with_tokens() {
        print_session_summary(42, 17.5);
    }

    #[test]
    fn print_session_summary_zero_tokens() {
        // Should only print "goodbye." with no stats line
        print_session_summary(0, 0.0);
    }
}
