//! Outbound mail.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// A report mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub to: Vec<String>,
    pub from: String,
    pub subject: String,
    pub body: String,
    /// Send as `text/html` instead of `text/plain`.
    pub html: bool,
}

impl MailMessage {
    /// The message as an RFC 5322 document.
    pub fn to_rfc5322(&self) -> String {
        let subtype = if self.html { "html" } else { "plain" };
        let mut message = String::new();
        message.push_str(&format!("From: {}\n", self.from));
        message.push_str(&format!("To: {}\n", self.to.join(", ")));
        message.push_str(&format!("Subject: {}\n", self.subject.replace(['\r', '\n'], " ")));
        message.push_str("MIME-Version: 1.0\n");
        message.push_str(&format!("Content-Type: text/{}; charset=utf-8\n", subtype));
        message.push('\n');
        message.push_str(&self.body);
        if !self.body.ends_with('\n') {
            message.push('\n');
        }
        message
    }
}

/// Delivers report mail. Callers treat every failure as non-fatal.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<()>;
}

/// Pipes messages into a `sendmail -t` compatible program.
#[derive(Debug, Clone)]
pub struct SendmailMailer {
    program: String,
    timeout: Duration,
}

impl SendmailMailer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl Mailer for SendmailMailer {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        if message.to.is_empty() {
            bail!("no recipients");
        }
        debug!("Mailing '{}' to {}", message.subject, message.to.join(","));

        let mut child = AsyncCommand::new(&self.program)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program))?;

        let mut stdin = child
            .stdin
            .take()
            .context("mail program has no stdin")?;
        let body = message.to_rfc5322();

        // The write shares the limit so a program that stops reading cannot
        // stall the cycle. Dropping the child on timeout kills it.
        let delivery = async {
            stdin
                .write_all(body.as_bytes())
                .await
                .with_context(|| format!("Failed to pipe message into {}", self.program))?;
            drop(stdin);
            child
                .wait_with_output()
                .await
                .with_context(|| format!("Failed to wait for {}", self.program))
        };
        let output = tokio::time::timeout(self.timeout, delivery)
            .await
            .with_context(|| format!("{} timed out", self.program))??;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mailer that records messages, or fails every send.
    #[derive(Default)]
    pub(crate) struct RecordingMailer {
        pub sent: Mutex<Vec<MailMessage>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, message: &MailMessage) -> Result<()> {
            if self.fail {
                bail!("connection refused");
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn message() -> MailMessage {
        MailMessage {
            to: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            from: "a@example.com".to_string(),
            subject: "clustercheck: 0 error".to_string(),
            body: "<h5>hello</h5>".to_string(),
            html: true,
        }
    }

    #[test]
    fn test_rfc5322_rendering() {
        let text = message().to_rfc5322();
        assert!(text.starts_with("From: a@example.com\nTo: a@example.com, b@example.com\n"));
        assert!(text.contains("Content-Type: text/html; charset=utf-8\n\n<h5>hello</h5>\n"));
    }

    #[tokio::test]
    async fn test_program_exit_status_decides_success() {
        // `cat -t` consumes the message and exits 0.
        let mailer = SendmailMailer::new("cat");
        mailer.send(&message()).await.unwrap();
    }

    #[tokio::test]
    async fn test_program_that_stops_reading_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("stuck-sendmail");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mailer = SendmailMailer {
            program: script.display().to_string(),
            timeout: Duration::from_millis(300),
        };
        // Far more than a pipe buffer holds.
        let mut large = message();
        large.body = "x".repeat(1 << 20);

        let started = std::time::Instant::now();
        let err = mailer.send(&large).await.unwrap_err();
        assert!(format!("{:#}", err).contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_failing_program_is_error() {
        let mailer = SendmailMailer::new("false");
        assert!(mailer.send(&message()).await.is_err());
    }
}
