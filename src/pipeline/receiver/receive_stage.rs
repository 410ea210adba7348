//! Receive stage for background operation
//!
//! Drives a [`ReceiverCoordinator`] on a fixed tick inside a tokio task.
//! Completed frames leave through a bounded channel; decoded audio leaves
//! through each session's ring buffer, announced with `SessionStarted`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::assembler::AssembledFrame;
use super::coordinator::{ReceiverCoordinator, ReceiverEvent};
use crate::pipeline::PipelineStage;
use crate::pipeline::health::SessionHealth;

/// A completed frame handed to the consumer.
#[derive(Debug)]
pub struct ReceivedFrame {
    pub sender_session_id: u32,
    pub frame: AssembledFrame,
    rendered: Arc<AtomicI64>,
}

impl ReceivedFrame {
    /// Tell the receiver this frame was displayed. Older frames still being
    /// assembled are then abandoned.
    pub fn mark_rendered(&self) {
        self.rendered
            .fetch_max(self.frame.frame_id as i64, Ordering::Release);
    }
}

/// Receive stage: socket → sessions → frame channel
pub struct ReceiveStage {
    coordinator: Option<ReceiverCoordinator>,
    frame_tx: Option<mpsc::Sender<ReceivedFrame>>,
    event_tx: Option<mpsc::Sender<ReceiverEvent>>,
    /// Last rendered frame per sender, -1 until something is shown
    rendered: HashMap<u32, Arc<AtomicI64>>,
    cancel: CancellationToken,
}

impl ReceiveStage {
    pub fn new(coordinator: ReceiverCoordinator) -> Self {
        Self {
            coordinator: Some(coordinator),
            frame_tx: None,
            event_tx: None,
            rendered: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Get the completed-frame output channel
    pub fn take_frame_output(&mut self) -> mpsc::Receiver<ReceivedFrame> {
        let capacity = self
            .coordinator
            .as_ref()
            .map_or(8, |c| c.config().frame_channel_capacity);
        let (tx, rx) = mpsc::channel(capacity);
        self.frame_tx = Some(tx);
        rx
    }

    /// Get the session event channel
    pub fn take_event_output(&mut self) -> mpsc::Receiver<ReceiverEvent> {
        let (tx, rx) = mpsc::channel(32);
        self.event_tx = Some(tx);
        rx
    }

    /// Token that stops the stage when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn forward_event(&mut self, event: ReceiverEvent) {
        match &event {
            ReceiverEvent::SessionStarted {
                sender_session_id, ..
            } => {
                self.rendered
                    .insert(*sender_session_id, Arc::new(AtomicI64::new(-1)));
            }
            ReceiverEvent::SessionEnded {
                sender_session_id, ..
            } => {
                self.rendered.remove(sender_session_id);
            }
            ReceiverEvent::ConnectFailed { .. } => {}
        }

        if let Some(tx) = &self.event_tx
            && let Err(e) = tx.try_send(event)
        {
            debug!("ReceiveStage: event not delivered: {}", e);
        }
    }
}

#[async_trait]
impl PipelineStage for ReceiveStage {
    async fn run(&mut self) -> Result<()> {
        let mut coordinator = self
            .coordinator
            .take()
            .ok_or_else(|| anyhow::anyhow!("ReceiveStage already ran"))?;
        let frame_tx = self
            .frame_tx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No frame output channel"))?;

        let mut ticker = tokio::time::interval(coordinator.config().poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("ReceiveStage: started");
        let mut delivered = 0u64;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();

            for session in coordinator.sessions_mut() {
                let rendered = self
                    .rendered
                    .get(&session.sender_session_id())
                    .map_or(-1, |r| r.load(Ordering::Acquire));
                if let Ok(frame_id) = u32::try_from(rendered) {
                    session.set_last_rendered(frame_id);
                }
            }

            for event in coordinator.poll(now) {
                self.forward_event(event);
            }

            for session in coordinator.sessions_mut() {
                // Nothing to set up in background mode: go straight to decoding.
                if !session.state().is_prepared()
                    && session.prepare_trigger_ready()
                    && let Err(e) = session.mark_prepared()
                {
                    warn!("ReceiveStage: {}", e);
                }

                let sender_session_id = session.sender_session_id();
                let Some(rendered) = self.rendered.get(&sender_session_id) else {
                    continue;
                };
                let frames: Vec<AssembledFrame> = session.completed_video_frames().collect();
                for frame in frames {
                    let item = ReceivedFrame {
                        sender_session_id,
                        frame,
                        rendered: rendered.clone(),
                    };
                    match frame_tx.try_send(item) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(item)) => {
                            debug!(
                                "ReceiveStage: consumer behind, dropping frame {}",
                                item.frame.frame_id
                            );
                            SessionHealth::incr(&session.health().frames_dropped);
                        }
                        Err(TrySendError::Closed(_)) => {
                            info!("ReceiveStage: frame output channel closed");
                            return Ok(());
                        }
                    }
                }
            }
        }

        info!("ReceiveStage: finished ({} frames delivered)", delivered);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ReceiveStage"
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}
