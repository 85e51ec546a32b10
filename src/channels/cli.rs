//! Terminal connector: stdin/stdout REPL for local use.
//!
//! Every line is heard as `user` in `channel`. Two escapes switch identity:
//! `|c<name>` changes channel (`|c` alone for a direct message) and
//! `|u<name>` changes user.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::channels::{Connector, ConnectorMessage, MessageFormat, MessageStream};
use crate::error::ChannelError;

pub const PROTOCOL: &str = "terminal";

pub struct TerminalConnector {
    user: String,
    channel: String,
}

impl TerminalConnector {
    pub fn new(user: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            channel: channel.into(),
        }
    }
}

/// What a line of terminal input means.
#[derive(Debug, PartialEq, Eq)]
enum TerminalInput {
    SwitchChannel(String),
    SwitchUser(String),
    Message(String),
    Blank,
}

fn parse_line(line: &str) -> TerminalInput {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("|c") {
        return TerminalInput::SwitchChannel(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix("|u") {
        let user = rest.trim();
        if !user.is_empty() {
            return TerminalInput::SwitchUser(user.to_string());
        }
    }
    if line.is_empty() {
        TerminalInput::Blank
    } else {
        TerminalInput::Message(line.to_string())
    }
}

fn prompt(user: &str, channel: &str) {
    let place = if channel.is_empty() { "(direct)" } else { channel };
    eprint!("{user}@{place}> ");
}

#[async_trait]
impl Connector for TerminalConnector {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut user = self.user.clone();
        let mut channel = self.channel.clone();

        tokio::spawn(async move {
            let reader = BufReader::new(tokio::io::stdin());
            let mut lines = reader.lines();
            prompt(&user, &channel);

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        match parse_line(&line) {
                            TerminalInput::SwitchChannel(c) => channel = c,
                            TerminalInput::SwitchUser(u) => user = u,
                            TerminalInput::Blank => {}
                            TerminalInput::Message(text) => {
                                let msg = ConnectorMessage::new(PROTOCOL, &user, &channel, text);
                                if tx.send(msg).is_err() {
                                    break;
                                }
                            }
                        }
                        prompt(&user, &channel);
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send_protocol_channel_thread_message(
        &self,
        channel_id: &str,
        thread_id: &str,
        msg: &str,
        _format: MessageFormat,
    ) -> Result<(), ChannelError> {
        let thread = if thread_id.is_empty() {
            String::new()
        } else {
            format!("(thread {thread_id})")
        };
        println!("\n{channel_id}{thread}: {msg}");
        Ok(())
    }

    async fn send_protocol_user_channel_thread_message(
        &self,
        _user_id: &str,
        user_name: &str,
        channel_id: &str,
        thread_id: &str,
        msg: &str,
        format: MessageFormat,
    ) -> Result<(), ChannelError> {
        self.send_protocol_channel_thread_message(
            channel_id,
            thread_id,
            &format!("@{user_name} {msg}"),
            format,
        )
        .await
    }

    async fn send_protocol_user_message(
        &self,
        user_id: &str,
        msg: &str,
        _format: MessageFormat,
    ) -> Result<(), ChannelError> {
        println!("\n(dm:{user_id}): {msg}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identity_switches() {
        assert_eq!(
            parse_line("|cops"),
            TerminalInput::SwitchChannel("ops".to_string())
        );
        assert_eq!(parse_line("|c"), TerminalInput::SwitchChannel(String::new()));
        assert_eq!(
            parse_line("|u bob"),
            TerminalInput::SwitchUser("bob".to_string())
        );
        assert_eq!(
            parse_line("  ;ping "),
            TerminalInput::Message(";ping".to_string())
        );
        assert_eq!(parse_line("   "), TerminalInput::Blank);
    }
}
