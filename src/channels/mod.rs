//! Connector abstraction for chat protocols.

pub mod cli;
pub mod manager;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

pub use cli::TerminalConnector;
pub use manager::ConnectorManager;

/// How a connector should render outgoing text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    Raw,
    Fixed,
    #[default]
    Variable,
}

/// A message heard by a connector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorMessage {
    pub protocol: String,
    /// User name; connectors may leave this empty and supply only `user_id`.
    pub user: String,
    pub user_id: String,
    /// Channel name; empty for a direct message.
    pub channel: String,
    pub channel_id: String,
    pub thread_id: String,
    pub threaded_message: bool,
    /// Set when the protocol itself marks the message as addressed to the robot.
    pub is_command: bool,
    pub text: String,
    #[serde(default)]
    pub format: MessageFormat,
}

impl ConnectorMessage {
    /// A plain channel message from `user`.
    pub fn new(
        protocol: impl Into<String>,
        user: impl Into<String>,
        channel: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let (user, channel) = (user.into(), channel.into());
        Self {
            protocol: protocol.into(),
            user_id: user.clone(),
            user,
            channel_id: channel.clone(),
            channel,
            text: text.into(),
            ..Default::default()
        }
    }

    /// Mark the message as addressed to the robot.
    pub fn as_command(mut self) -> Self {
        self.is_command = true;
        self
    }

    /// Place the message in a thread.
    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self.threaded_message = true;
        self
    }

    pub fn is_direct(&self) -> bool {
        self.channel.is_empty() && self.channel_id.is_empty()
    }
}

/// Stream of inbound messages from a connector.
pub type MessageStream = Pin<Box<dyn Stream<Item = ConnectorMessage> + Send>>;

/// A chat protocol driver.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Protocol name, e.g. "terminal" or "slack".
    fn protocol(&self) -> &str;

    /// Start listening and return the inbound message stream.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Post to a channel, optionally in a thread (empty `thread_id` for none).
    async fn send_protocol_channel_thread_message(
        &self,
        channel_id: &str,
        thread_id: &str,
        msg: &str,
        format: MessageFormat,
    ) -> Result<(), ChannelError>;

    /// Post to a channel, addressed to a user.
    async fn send_protocol_user_channel_thread_message(
        &self,
        user_id: &str,
        user_name: &str,
        channel_id: &str,
        thread_id: &str,
        msg: &str,
        format: MessageFormat,
    ) -> Result<(), ChannelError>;

    /// Send a direct message.
    async fn send_protocol_user_message(
        &self,
        user_id: &str,
        msg: &str,
        format: MessageFormat,
    ) -> Result<(), ChannelError>;

    /// The robot heard a command from `user` in `channel`; a typing indicator
    /// or reaction, if the protocol has one.
    async fn message_heard(&self, _user_id: &str, _channel_id: &str) {}

    /// Gracefully shut down.
    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
