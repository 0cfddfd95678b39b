//! Pod actor
//!
//! `PodRuntime::run` is the single coordination task of a pod. Its only
//! blocking point is the inbound queue, waited on with a timeout equal to the
//! nearest pending deadline. The transport's receive task and the game feed
//! the same queue; sends are fire-and-forget.

use crate::config::PodConfig;
use crate::drill::DrillProgram;
use crate::error::SessionError;
use crate::game::GameCapability;
use crate::outbox::Destination;
use crate::session::{Notice, PodInput, SessionCoordinator, SessionStatus};
use crate::transport::Transport;
use crate::types::{PriorityScore, ResignReason, TimeUs};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Longest idle wait when nothing is scheduled
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Handle for talking to a running pod
#[derive(Debug)]
pub struct PodHandle {
    inbox: mpsc::UnboundedSender<PodInput>,
    status: watch::Receiver<SessionStatus>,
    notices: mpsc::UnboundedReceiver<Notice>,
}

impl PodHandle {
    fn submit(&self, input: PodInput) -> Result<(), SessionError> {
        self.inbox.send(input).map_err(|_| SessionError::Stopped)
    }

    pub fn start_drill(&self, program: DrillProgram) -> Result<(), SessionError> {
        program.validate()?;
        self.submit(PodInput::StartDrill(program))
    }

    pub fn abort_drill(&self) -> Result<(), SessionError> {
        self.submit(PodInput::AbortDrill)
    }

    pub fn force_master(&self) -> Result<(), SessionError> {
        self.submit(PodInput::ForceMaster)
    }

    pub fn resign(&self, reason: ResignReason) -> Result<(), SessionError> {
        self.submit(PodInput::Resign(reason))
    }

    pub fn update_vitals(&self, battery: u8, link_quality: u8) -> Result<(), SessionError> {
        self.submit(PodInput::UpdateVitals {
            battery,
            link_quality,
        })
    }

    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.submit(PodInput::Shutdown)
    }

    /// Latest status snapshot
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// A receiver that is notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Next outward notice, or None once the pod has stopped
    pub async fn next_notice(&mut self) -> Option<Notice> {
        self.notices.recv().await
    }

    /// Sender feeding the pod's input queue
    pub fn inbox(&self) -> mpsc::UnboundedSender<PodInput> {
        self.inbox.clone()
    }
}

/// The coordination task of one pod
pub struct PodRuntime<T: Transport> {
    coordinator: SessionCoordinator,
    transport: Arc<T>,
    inbox_tx: mpsc::UnboundedSender<PodInput>,
    inbox_rx: mpsc::UnboundedReceiver<PodInput>,
    status_tx: watch::Sender<SessionStatus>,
    notice_tx: mpsc::UnboundedSender<Notice>,
    boot: Instant,
}

impl<T: Transport + 'static> PodRuntime<T> {
    pub fn new(
        transport: Arc<T>,
        priority: PriorityScore,
        config: PodConfig,
        game: Box<dyn GameCapability>,
    ) -> (Self, PodHandle) {
        let own = transport.own_address();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::empty(own));
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let coordinator = SessionCoordinator::new(own, priority, config, game, inbox_tx.clone());

        let handle = PodHandle {
            inbox: inbox_tx.clone(),
            status: status_rx,
            notices: notice_rx,
        };

        let runtime = Self {
            coordinator,
            transport,
            inbox_tx,
            inbox_rx,
            status_tx,
            notice_tx,
            boot: Instant::now(),
        };
        (runtime, handle)
    }

    /// Sender feeding this pod's input queue, for the transport receive task
    pub fn inbox(&self) -> mpsc::UnboundedSender<PodInput> {
        self.inbox_tx.clone()
    }

    /// Local clock: microseconds since this runtime was created
    fn local_now(&self) -> TimeUs {
        self.boot.elapsed().as_micros() as TimeUs
    }

    fn instant_at(&self, local: TimeUs) -> Instant {
        self.boot + Duration::from_micros(local)
    }

    /// Run until shutdown or until every input sender is gone
    pub async fn run(mut self) {
        let now = self.local_now();
        self.coordinator.start(now);
        self.flush(now);

        loop {
            let deadline = match self.coordinator.next_deadline() {
                Some(at) => self.instant_at(at),
                None => Instant::now() + IDLE_WAIT,
            };

            let input = match timeout_at(deadline, self.inbox_rx.recv()).await {
                Ok(Some(input)) => input,
                Ok(None) => {
                    info!("Session: Input queue closed");
                    break;
                }
                Err(_) => PodInput::Tick,
            };

            let now = self.local_now();
            if let Err(e) = self.coordinator.handle(input, now) {
                warn!("Session: Request refused: {}", e);
            }
            self.flush(now);

            if self.coordinator.is_stopped() {
                break;
            }
        }

        info!("Session: Pod {} stopped", self.coordinator.own_addr());
    }

    /// Hand queued frames to the transport, publish status and notices
    fn flush(&mut self, now: TimeUs) {
        for (dest, msg) in self.coordinator.take_frames(now) {
            let frame = match msg.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Session: Could not encode {}: {}", msg.msg_type().name(), e);
                    continue;
                }
            };

            let sent = match dest {
                Destination::Unicast(to) => self.transport.send(to, &frame),
                Destination::Broadcast => self.transport.broadcast(&frame),
            };
            if let Err(e) = sent {
                debug!("Session: Send of {} seq {} failed: {}", msg.msg_type().name(), msg.header.sequence, e);
                if let Destination::Unicast(_) = dest {
                    let _ = self.inbox_tx.send(PodInput::DeliveryFailed {
                        seq: msg.header.sequence,
                    });
                }
            }
        }

        for notice in self.coordinator.take_notices() {
            let _ = self.notice_tx.send(notice);
        }

        self.status_tx.send_replace(self.coordinator.status(now));
    }
}
