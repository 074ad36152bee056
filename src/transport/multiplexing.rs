//! Yamux-style logical stream multiplexing over one physical connection,
//! adapted from the teacher's `networking::pool::multiplexing` module.
//! Framing favors simplicity over the teacher's flow-control windows: one
//! length-prefixed [`crate::transport::Frame`] per logical message, tagged
//! with a stream id the receiver uses to demux.

use crate::common::NodeId;
use crate::error::Result;
use crate::transport::Frame;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

pub type StreamId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for StreamPriority {
    fn default() -> Self {
        StreamPriority::Normal
    }
}

/// One logical stream's inbound queue; outbound frames are written
/// directly to the shared connection sink tagged with this stream's id.
pub struct StreamHandle {
    pub id: StreamId,
    pub priority: StreamPriority,
    inbound: mpsc::Receiver<Bytes>,
}

impl StreamHandle {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }
}

struct StreamState {
    priority: StreamPriority,
    sender: mpsc::Sender<Bytes>,
}

/// A single physical connection carrying many logical streams, the unit a
/// [`crate::transport::pool::ConnectionPool`] manages per peer.
pub struct MultiplexedConnection {
    peer: NodeId,
    streams: Arc<RwLock<HashMap<StreamId, StreamState>>>,
    next_stream_id: AtomicU32,
    outbound: mpsc::Sender<Frame>,
    max_streams: usize,
}

impl MultiplexedConnection {
    pub fn new(peer: NodeId, outbound: mpsc::Sender<Frame>, max_streams: usize) -> Self {
        Self {
            peer,
            streams: Arc::new(RwLock::new(HashMap::new())),
            next_stream_id: AtomicU32::new(1),
            outbound,
            max_streams,
        }
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    /// Open a new logical stream, failing once `max_streams` concurrent
    /// streams are already open on this connection (spec: bound
    /// per-connection fan-out so one noisy RPC caller can't starve gossip
    /// traffic sharing the same socket).
    pub async fn open_stream(&self, priority: StreamPriority) -> Result<StreamHandle> {
        let mut streams = self.streams.write().await;
        if streams.len() >= self.max_streams {
            return Err(crate::error::AgentError::Transport(format!(
                "connection to {} has reached max_streams={}",
                self.peer, self.max_streams
            )));
        }
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        streams.insert(id, StreamState { priority, sender: tx });
        Ok(StreamHandle {
            id,
            priority,
            inbound: rx,
        })
    }

    pub async fn close_stream(&self, id: StreamId) {
        self.streams.write().await.remove(&id);
    }

    pub async fn active_stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Route an inbound frame (already demultiplexed from the wire) to its
    /// stream's queue, dropping it if the stream has since closed.
    pub async fn dispatch_inbound(&self, stream_id: StreamId, payload: Bytes) {
        let streams = self.streams.read().await;
        if let Some(state) = streams.get(&stream_id) {
            let _ = state.sender.send(payload).await;
        }
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| crate::error::AgentError::Transport("connection outbound channel closed".to_string()))
    }

    /// Highest-priority open stream, used when deciding which backlog to
    /// service first under write back-pressure.
    pub async fn highest_priority(&self) -> Option<StreamPriority> {
        self.streams.read().await.values().map(|s| s.priority).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Channel;

    #[tokio::test]
    async fn open_stream_respects_max_streams() {
        let (tx, _rx) = mpsc::channel(8);
        let conn = MultiplexedConnection::new(NodeId::new("peer"), tx, 1);
        assert!(conn.open_stream(StreamPriority::Normal).await.is_ok());
        assert!(conn.open_stream(StreamPriority::Normal).await.is_err());
    }

    #[tokio::test]
    async fn dispatch_inbound_delivers_to_open_stream() {
        let (tx, _rx) = mpsc::channel(8);
        let conn = MultiplexedConnection::new(NodeId::new("peer"), tx, 4);
        let mut handle = conn.open_stream(StreamPriority::High).await.unwrap();
        conn.dispatch_inbound(handle.id, Bytes::from_static(b"hello")).await;
        assert_eq!(handle.recv().await, Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn send_frame_forwards_to_outbound_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = MultiplexedConnection::new(NodeId::new("peer"), tx, 4);
        conn.send_frame(Frame {
            channel: Channel::Gossip,
            from: NodeId::new("peer"),
            payload: vec![1, 2, 3],
        })
        .await
        .unwrap();
        assert!(rx.recv().await.is_some());
    }
}
