//! Report destinations and their decoration.
//!
//! The same event stream fans out to up to five destinations. Console
//! writes are immediate; the others are buffers with their own open/close
//! lifecycle that the aggregator flushes to files or mail at cycle end.

use crate::config::MailFormat;
use crate::models::{Lnn, Severity};
use std::fmt;
use std::io::Write;

/// A place report lines go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Destination {
    Console,
    DetailLog,
    CycleScratch,
    CycleSummary,
    MailBody,
}

impl Destination {
    pub fn name(&self) -> &'static str {
        match self {
            Destination::Console => "console",
            Destination::DetailLog => "log",
            Destination::CycleScratch => "scratch file",
            Destination::CycleSummary => "summary file",
            Destination::MailBody => "mail body",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Escape text for inclusion in HTML.
pub fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Console rendering: `Node n: <color>LABEL<reset>text`.
pub fn console_line(lnn: Option<Lnn>, severity: Severity, text: &str, color: bool) -> String {
    let decoration = severity.decoration();
    let node = lnn.map(|l| format!("Node {}: ", l)).unwrap_or_default();
    if color {
        format!(
            "{}\x1b[{}m{}\x1b[0m{}\n",
            node, decoration.ansi, decoration.label, text
        )
    } else {
        format!("{}{}{}\n", node, decoration.label, text)
    }
}

/// Persistent log rendering: the node prefix stays outside the markup.
pub fn log_line(lnn: Option<Lnn>, severity: Severity, line: &str) -> String {
    let d = severity.decoration();
    let node = lnn.map(|l| format!("Node {}: ", l)).unwrap_or_default();
    format!(
        "{}{}{}{}{}\n",
        node,
        d.html_open,
        d.label,
        html_escape(line),
        d.html_close
    )
}

/// Summary and scratch rendering: the node prefix goes inside the markup.
pub fn summary_line(lnn: Option<Lnn>, severity: Severity, line: &str) -> String {
    let d = severity.decoration();
    let node = lnn.map(|l| format!("Node {}: ", l)).unwrap_or_default();
    format!(
        "{}{}{}{}{}\n",
        d.html_open,
        node,
        d.label,
        html_escape(line),
        d.html_close
    )
}

/// Plain-text rendering for plain mail bodies.
pub fn plain_line(lnn: Option<Lnn>, severity: Severity, line: &str) -> String {
    console_line(lnn, severity, line, false)
}

/// The buffered destinations plus the console sink.
pub struct Destinations {
    console: Option<Box<dyn Write + Send>>,
    color: bool,
    mail_format: MailFormat,
    log: Option<String>,
    scratch: Option<String>,
    summary: Option<String>,
    mail: Option<String>,
}

impl fmt::Debug for Destinations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destinations")
            .field("console", &self.console.is_some())
            .field("color", &self.color)
            .field("log", &self.log.is_some())
            .field("scratch", &self.scratch.is_some())
            .field("summary", &self.summary.is_some())
            .field("mail", &self.mail.is_some())
            .finish()
    }
}

impl Destinations {
    /// Destinations with the given console sink (`None` disables console
    /// output). Every buffer starts closed.
    pub fn new(console: Option<Box<dyn Write + Send>>, color: bool, mail_format: MailFormat) -> Self {
        Self {
            console,
            color,
            mail_format,
            log: None,
            scratch: None,
            summary: None,
            mail: None,
        }
    }

    /// Console on stderr when `verbose`.
    pub fn stderr(verbose: bool, color: bool, mail_format: MailFormat) -> Self {
        let console: Option<Box<dyn Write + Send>> = if verbose {
            Some(Box::new(std::io::stderr()))
        } else {
            None
        };
        Self::new(console, color, mail_format)
    }

    fn buffer(&mut self, dest: Destination) -> Option<&mut Option<String>> {
        match dest {
            Destination::Console => None,
            Destination::DetailLog => Some(&mut self.log),
            Destination::CycleScratch => Some(&mut self.scratch),
            Destination::CycleSummary => Some(&mut self.summary),
            Destination::MailBody => Some(&mut self.mail),
        }
    }

    /// Open a buffered destination with empty content. Reopening discards
    /// what was buffered.
    pub fn open(&mut self, dest: Destination) {
        if let Some(slot) = self.buffer(dest) {
            *slot = Some(String::new());
        }
    }

    /// Close a buffered destination and take its content.
    pub fn close(&mut self, dest: Destination) -> Option<String> {
        self.buffer(dest).and_then(Option::take)
    }

    pub fn is_open(&self, dest: Destination) -> bool {
        match dest {
            Destination::Console => self.console.is_some(),
            Destination::DetailLog => self.log.is_some(),
            Destination::CycleScratch => self.scratch.is_some(),
            Destination::CycleSummary => self.summary.is_some(),
            Destination::MailBody => self.mail.is_some(),
        }
    }

    /// Content buffered so far, if open.
    pub fn content(&self, dest: Destination) -> Option<&str> {
        match dest {
            Destination::Console => None,
            Destination::DetailLog => self.log.as_deref(),
            Destination::CycleScratch => self.scratch.as_deref(),
            Destination::CycleSummary => self.summary.as_deref(),
            Destination::MailBody => self.mail.as_deref(),
        }
    }

    /// Append raw, already decorated text to one open buffer.
    pub fn append_raw(&mut self, dest: Destination, text: &str) {
        if let Some(Some(buffer)) = self.buffer(dest) {
            buffer.push_str(text);
        }
    }

    /// Write one event to every open destination, each with its own
    /// decoration. Multi-line text becomes one decorated line per line in
    /// the buffered destinations.
    pub fn write(&mut self, lnn: Option<Lnn>, severity: Severity, text: &str) {
        if let Some(console) = self.console.as_mut() {
            // Console failures (closed stderr) are not worth aborting over.
            let _ = console.write_all(console_line(lnn, severity, text, self.color).as_bytes());
        }

        let lines: Vec<&str> = if text.is_empty() {
            vec![""]
        } else {
            text.lines().collect()
        };
        for line in lines {
            if let Some(log) = self.log.as_mut() {
                log.push_str(&log_line(lnn, severity, line));
            }
            if let Some(scratch) = self.scratch.as_mut() {
                scratch.push_str(&summary_line(lnn, severity, line));
            }
            if let Some(summary) = self.summary.as_mut() {
                summary.push_str(&summary_line(lnn, severity, line));
            }
            if let Some(mail) = self.mail.as_mut() {
                let rendered = match self.mail_format {
                    MailFormat::Html => summary_line(lnn, severity, line),
                    MailFormat::Plain => plain_line(lnn, severity, line),
                };
                mail.push_str(&rendered);
            }
        }
    }

    pub fn flush_console(&mut self) {
        if let Some(console) = self.console.as_mut() {
            let _ = console.flush();
        }
    }
}
