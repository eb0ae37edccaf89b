use std::io::Write;

use owo_colors::{AnsiColors, OwoColorize};
use tokio::sync::mpsc;

use crate::config::Decoration;
use crate::rule::OutMsg;

const PALETTE: [AnsiColors; 6] = [
    AnsiColors::Cyan,
    AnsiColors::Yellow,
    AnsiColors::Green,
    AnsiColors::Magenta,
    AnsiColors::Blue,
    AnsiColors::Red,
];

/// Formats one output line for display.
pub fn format_line(msg: &OutMsg, decoration: Decoration) -> String {
    match decoration {
        Decoration::None => msg.line.clone(),
        Decoration::Plain => format!("[{:02}] {}", msg.rule_id, msg.line),
        Decoration::Fancy => {
            let prefix = format!("[{:02}]", msg.rule_id);
            let color = PALETTE[msg.rule_id % PALETTE.len()];
            format!("{} {}", prefix.color(color).bold(), msg.line)
        }
    }
}

/// Drains the shared output sink to stdout until every sender is gone.
pub async fn print(mut rx: mpsc::UnboundedReceiver<OutMsg>, decoration: Decoration) {
    while let Some(msg) = rx.recv().await {
        let line = format_line(&msg, decoration);
        if writeln!(std::io::stdout().lock(), "{line}").is_err() {
            break;
        }
    }
}
