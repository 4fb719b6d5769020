//! Terminal styling for the startup banner and route listing.

use crate::gateway::{LiveTable, RouteStatus};

pub fn blue(s: &str) -> String {
    format!("\x1b[38;5;39m{}\x1b[0m", s)
}
pub fn yellow(s: &str) -> String {
    format!("\x1b[33m{}\x1b[0m", s)
}
pub fn green(s: &str) -> String {
    format!("\x1b[32m{}\x1b[0m", s)
}
pub fn gray(s: &str) -> String {
    format!("\x1b[90m{}\x1b[0m", s)
}
pub fn red(s: &str) -> String {
    format!("\x1b[31m{}\x1b[0m", s)
}

/// One line per route: endpoint, methods, and status.
pub fn route_listing(table: &LiveTable) -> String {
    let width = table.routes().iter().map(|r| r.endpoint.len()).max().unwrap_or(0);
    let mut out = String::new();
    for live in table.routes() {
        let methods = live
            .route
            .as_ref()
            .map(|r| r.methods.iter().cloned().collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        let status = match &live.status {
            RouteStatus::Serving | RouteStatus::Loaded => green(&methods),
            RouteStatus::Failed { stage, .. } => red(&format!("{stage} failed")),
            RouteStatus::Unbuilt | RouteStatus::Built => yellow("pending"),
        };
        out.push_str(&format!("  {:<width$}  {}\n", live.endpoint, status));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_lists_nothing() {
        assert!(route_listing(&LiveTable::default()).is_empty());
    }

    #[test]
    fn styles_wrap_in_reset_codes() {
        assert_eq!(gray("x"), "\x1b[90mx\x1b[0m");
        assert!(blue("x").ends_with("\x1b[0m"));
    }
}
