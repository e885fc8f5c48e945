//! Auxiliary data channel: the open handshake and the send queue, plus the
//! `webrtc` channel wrapper.
//!
//! The side that opens a channel defers every send until the peer echoes
//! [`HANDSHAKE_SENTINEL`]. The side that receives the channel echoes the
//! sentinel once the transport reports that channel open. Messages are never
//! dropped while waiting: they sit in `pending` and go out in order.

use crate::error::{Error, Result};
use crate::peer::state::HANDSHAKE_SENTINEL;
use crate::peer::transport::{DataChannel, TransportEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

pub struct MessageChannel<C> {
    channel: Option<Arc<C>>,
    ready: bool,
    /// Remote channel whose echo has not gone out yet
    echo_pending: bool,
    pending: VecDeque<String>,
}

impl<C: DataChannel> Default for MessageChannel<C> {
    fn default() -> Self {
        Self {
            channel: None,
            ready: false,
            echo_pending: false,
            pending: VecDeque::new(),
        }
    }
}

impl<C: DataChannel> MessageChannel<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// True once the handshake completed on this side.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn label(&self) -> Option<&str> {
        self.channel.as_deref().map(|c| c.label())
    }

    /// Channel created by this side; sends stay queued until the echo.
    pub fn opened_locally(&mut self, channel: Arc<C>) {
        debug!(label = channel.label(), "data channel opened locally, awaiting echo");
        self.channel = Some(channel);
        self.ready = false;
        self.echo_pending = false;
    }

    /// Channel announced by the remote side. The echo goes out right away
    /// when the channel is already open, otherwise on [`Self::opened`].
    pub async fn accept_remote(&mut self, channel: Arc<C>) -> Result<()> {
        let open = channel.is_open();
        debug!(label = channel.label(), open, "remote data channel accepted");
        self.channel = Some(channel);
        self.ready = false;
        self.echo_pending = true;
        if open {
            self.echo().await?;
        }
        Ok(())
    }

    /// The transport reported `label` open. Completes a pending echo.
    pub async fn opened(&mut self, label: &str) -> Result<()> {
        if self.echo_pending && self.label() == Some(label) {
            self.echo().await?;
        }
        Ok(())
    }

    async fn echo(&mut self) -> Result<()> {
        let Some(channel) = self.channel.as_ref() else {
            return Ok(());
        };
        channel.send_text(HANDSHAKE_SENTINEL).await?;
        info!(label = channel.label(), "handshake echoed");
        self.echo_pending = false;
        self.ready = true;
        self.flush().await
    }

    /// Sends now when the handshake is done, otherwise queues.
    pub async fn send(&mut self, text: String) -> Result<()> {
        if text == HANDSHAKE_SENTINEL {
            return Err(Error::ReservedPayload);
        }
        self.pending.push_back(text);
        if self.ready {
            self.flush().await?;
        }
        Ok(())
    }

    /// Handles incoming text. Returns the application payload, or `None`
    /// when the text was the handshake sentinel.
    pub async fn receive(&mut self, text: String) -> Result<Option<String>> {
        if text != HANDSHAKE_SENTINEL {
            return Ok(Some(text));
        }
        if self.channel.is_some() && !self.ready && !self.echo_pending {
            info!("data channel handshake complete");
            self.ready = true;
            self.flush().await?;
        }
        Ok(None)
    }

    /// Forgets the channel when `label` matches it. Queued text is kept for
    /// the next channel.
    pub fn closed(&mut self, label: &str) {
        if self.label() == Some(label) {
            debug!(label, pending = self.pending.len(), "data channel closed");
            self.channel = None;
            self.ready = false;
            self.echo_pending = false;
        }
    }

    /// Drops the channel and everything queued.
    pub async fn close(&mut self) -> Result<()> {
        self.ready = false;
        self.echo_pending = false;
        self.pending.clear();
        if let Some(channel) = self.channel.take() {
            channel.close().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let Some(channel) = self.channel.as_ref() else {
            return Ok(());
        };
        while let Some(text) = self.pending.front() {
            channel.send_text(text).await?;
            self.pending.pop_front();
        }
        Ok(())
    }
}

/// `webrtc` data channel behind the [`DataChannel`] seam.
pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl RtcChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self { dc }
    }
}

impl fmt::Debug for RtcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcChannel")
            .field("label", &self.dc.label())
            .finish()
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.dc.send_text(text.to_string()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}

/// Wires the channel's open/message/close handlers into the event queue.
pub fn attach_dc(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<TransportEvent<RtcChannel>>) {
    let label = dc.label().to_string();

    dc.on_open(Box::new({
        let events = events.clone();
        let label = label.clone();
        move || {
            let _ = events.send(TransportEvent::ChannelOpen { label });
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let events = events.clone();
        let label = label.clone();
        move |msg: DataChannelMessage| {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            let _ = events.send(TransportEvent::ChannelMessage {
                label: label.clone(),
                text,
            });
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new(move || {
        let _ = events.send(TransportEvent::ChannelClose {
            label: label.clone(),
        });
        Box::pin(async {})
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
        fail: AtomicBool,
        connecting: AtomicBool,
    }

    impl RecordingChannel {
        fn connecting() -> Self {
            let channel = Self::default();
            channel.connecting.store(true, Ordering::Relaxed);
            channel
        }
    }

    #[async_trait]
    impl DataChannel for RecordingChannel {
        fn label(&self) -> &str {
            "text chat"
        }

        fn is_open(&self) -> bool {
            !self.connecting.load(Ordering::Relaxed)
        }

        async fn send_text(&self, text: &str) -> Result<()> {
            if !self.is_open() || self.fail.load(Ordering::Relaxed) {
                return Err(Error::Transport("send failed".into()));
            }
            self.sent.lock().push(text.to_string());
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn opener_queues_until_echo() {
        let raw = Arc::new(RecordingChannel::default());
        let mut channel = MessageChannel::new();
        channel.opened_locally(Arc::clone(&raw));

        channel.send("hello".into()).await.unwrap();
        channel.send("world".into()).await.unwrap();
        assert!(raw.sent.lock().is_empty());
        assert_eq!(channel.pending_len(), 2);

        let delivered = channel.receive(HANDSHAKE_SENTINEL.into()).await.unwrap();
        assert_eq!(delivered, None);
        assert!(channel.is_ready());
        assert_eq!(*raw.sent.lock(), vec!["hello".to_string(), "world".to_string()]);
    }

    #[tokio::test]
    async fn acceptor_echoes_before_anything_else() {
        let raw = Arc::new(RecordingChannel::default());
        let mut channel = MessageChannel::new();
        channel.send("queued".into()).await.unwrap();
        channel.accept_remote(Arc::clone(&raw)).await.unwrap();
        assert_eq!(
            *raw.sent.lock(),
            vec![HANDSHAKE_SENTINEL.to_string(), "queued".to_string()]
        );
    }

    #[tokio::test]
    async fn sentinel_is_never_delivered_or_sent_as_text() {
        let mut channel: MessageChannel<RecordingChannel> = MessageChannel::new();
        assert!(matches!(
            channel.send(HANDSHAKE_SENTINEL.into()).await,
            Err(Error::ReservedPayload)
        ));
        assert_eq!(channel.receive(HANDSHAKE_SENTINEL.into()).await.unwrap(), None);
        assert_eq!(
            channel.receive("hi".into()).await.unwrap(),
            Some("hi".to_string())
        );
    }

    #[tokio::test]
    async fn failed_flush_keeps_message() {
        let raw = Arc::new(RecordingChannel::default());
        let mut channel = MessageChannel::new();
        channel.opened_locally(Arc::clone(&raw));
        channel.send("keep me".into()).await.unwrap();

        raw.fail.store(true, Ordering::Relaxed);
        assert!(channel.receive(HANDSHAKE_SENTINEL.into()).await.is_err());
        assert_eq!(channel.pending_len(), 1);

        raw.fail.store(false, Ordering::Relaxed);
        channel.send("and me".into()).await.unwrap();
        assert_eq!(
            *raw.sent.lock(),
            vec!["keep me".to_string(), "and me".to_string()]
        );
    }

    #[tokio::test]
    async fn close_event_keeps_queue_for_next_channel() {
        let first = Arc::new(RecordingChannel::default());
        let mut channel = MessageChannel::new();
        channel.opened_locally(Arc::clone(&first));
        channel.send("later".into()).await.unwrap();
        channel.closed("text chat");
        assert!(!channel.has_channel());

        let second = Arc::new(RecordingChannel::default());
        channel.accept_remote(Arc::clone(&second)).await.unwrap();
        assert_eq!(
            *second.sent.lock(),
            vec![HANDSHAKE_SENTINEL.to_string(), "later".to_string()]
        );
    }

    #[tokio::test]
    async fn acceptor_echoes_once_the_channel_opens() {
        let raw = Arc::new(RecordingChannel::connecting());
        let mut channel = MessageChannel::new();
        channel.send("queued".into()).await.unwrap();
        channel.accept_remote(Arc::clone(&raw)).await.unwrap();
        assert!(channel.has_channel());
        assert!(!channel.is_ready());
        assert!(raw.sent.lock().is_empty());

        // An early sentinel on a channel still waiting to echo changes nothing.
        assert_eq!(channel.receive(HANDSHAKE_SENTINEL.into()).await.unwrap(), None);
        assert!(!channel.is_ready());

        channel.opened("another label").await.unwrap();
        assert!(raw.sent.lock().is_empty());

        raw.connecting.store(false, Ordering::Relaxed);
        channel.opened("text chat").await.unwrap();
        assert!(channel.is_ready());
        assert_eq!(
            *raw.sent.lock(),
            vec![HANDSHAKE_SENTINEL.to_string(), "queued".to_string()]
        );

        channel.opened("text chat").await.unwrap();
        assert_eq!(raw.sent.lock().len(), 2);
    }
}
