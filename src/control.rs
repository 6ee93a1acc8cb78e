//! Control point request/response state machine.
//!
//! The control point carries one request at a time. A submitted request moves
//! the machine from idle to awaiting a response; the matching indication, a
//! timeout, a disconnect or the caller abandoning the call moves it back. Each
//! submitted request resolves exactly once.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    ble::Transport,
    capability::CapabilitySet,
    error::{ControlError, FtmsError, Result},
    protocol::{ControlOpCode, ControlRequest, ControlResponse},
};

/// Whether this client currently holds control of the machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlAccess {
    /// Never requested, or reset by the machine
    #[default]
    Unknown,
    /// Request Control succeeded
    Granted,
    /// The link dropped; only Request Control is accepted
    Revoked,
}

impl fmt::Display for ControlAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Granted => write!(f, "Granted"),
            Self::Revoked => write!(f, "Revoked"),
        }
    }
}

struct Pending {
    op: u8,
    seq: u64,
    completion: oneshot::Sender<Result<ControlResponse>>,
}

#[derive(Default)]
struct State {
    pending: Option<Pending>,
    access: ControlAccess,
    next_seq: u64,
}

/// Serializes commands over the Fitness Machine Control Point
pub struct ControlPoint {
    transport: Arc<dyn Transport>,
    characteristic: Uuid,
    capabilities: Arc<CapabilitySet>,
    timeout: Duration,
    state: Mutex<State>,
}

/// Clears the pending slot if the submitting future goes away first
struct PendingGuard<'a> {
    control: &'a ControlPoint,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.control.take_pending(self.seq) {
            debug!(
                "Control request {:#04x} abandoned before resolution",
                pending.op
            );
        }
    }
}

impl ControlPoint {
    /// Create an idle control point
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        characteristic: Uuid,
        capabilities: Arc<CapabilitySet>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            characteristic,
            capabilities,
            timeout,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending(&self, seq: u64) -> Option<Pending> {
        let mut state = self.lock();
        if state.pending.as_ref().is_some_and(|p| p.seq == seq) {
            state.pending.take()
        } else {
            None
        }
    }

    /// Current control access
    #[must_use]
    pub fn access(&self) -> ControlAccess {
        self.lock().access
    }

    /// Whether no request is outstanding
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.lock().pending.is_none()
    }

    /// Configured response timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Validate, encode and write a request, then wait for its indication
    ///
    /// Validation and encoding happen before the state changes, so a rejected
    /// request leaves the control point untouched.
    ///
    /// # Errors
    ///
    /// - [`FtmsError::NotSupported`] / [`FtmsError::OutOfRange`] if the machine
    ///   does not advertise the setting or value
    /// - [`FtmsError::Busy`] if another request is outstanding
    /// - [`FtmsError::ControlNotAcquired`] after a disconnect until Request
    ///   Control is sent again
    /// - [`FtmsError::ProtocolMismatch`] if the indication echoes another op code
    /// - [`FtmsError::Control`] if the machine rejects the request
    /// - [`FtmsError::Timeout`] / [`FtmsError::Disconnected`] if no indication
    ///   arrives
    pub async fn submit(&self, request: ControlRequest) -> Result<ControlResponse> {
        request.validate(&self.capabilities)?;
        let payload = request.encode()?;
        let op = request.op_code();

        let (seq, mut completion) = {
            let mut state = self.lock();
            if let Some(pending) = &state.pending {
                return Err(FtmsError::Busy {
                    pending: pending.op,
                });
            }
            if state.access == ControlAccess::Revoked && op != ControlOpCode::RequestControl {
                return Err(FtmsError::ControlNotAcquired);
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            state.pending = Some(Pending {
                op: op as u8,
                seq,
                completion: tx,
            });
            (seq, rx)
        };
        let _guard = PendingGuard { control: self, seq };

        debug!("Control write {}: {:02X?}", op, &payload[..]);
        let exchange = async {
            if let Err(e) = self
                .transport
                .write(self.characteristic, &payload, true)
                .await
            {
                warn!("Control write {} failed: {}", op, e);
                return Err(e);
            }
            (&mut completion)
                .await
                .unwrap_or(Err(FtmsError::Disconnected))
        };

        // The write and the indication share one deadline.
        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                if self.take_pending(seq).is_some() {
                    let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                    warn!("Control request {} timed out after {}ms", op, timeout_ms);
                    return Err(FtmsError::Timeout { timeout_ms });
                }
                // Resolved while the timer fired; the completion was sent under
                // the state lock, so it is already in the channel.
                completion
                    .try_recv()
                    .unwrap_or(Err(FtmsError::Disconnected))
            }
        }
    }

    /// Handle an indication from the control point characteristic
    ///
    /// Returns the response when it resolved the pending request, whether the
    /// machine accepted or rejected it. Malformed, mismatched and unsolicited
    /// indications return `None`.
    pub fn on_indication(&self, data: &[u8]) -> Option<ControlResponse> {
        let decoded = ControlResponse::decode(data);

        let mut state = self.lock();
        let Some(pending) = state.pending.take() else {
            warn!(
                "Discarding control point indication with nothing pending: {:02X?}",
                data
            );
            return None;
        };

        let mut resolved = None;
        let outcome = match decoded {
            Err(e) => {
                warn!("Malformed control point indication {:02X?}: {}", data, e);
                Err(e)
            }
            Ok(response) if response.request_op != pending.op => {
                warn!(
                    "Indication for op {:#04x} while {:#04x} is pending",
                    response.request_op, pending.op
                );
                Err(FtmsError::ProtocolMismatch {
                    expected: pending.op,
                    received: response.request_op,
                })
            }
            Ok(response) => {
                resolved = Some(response.clone());
                match response.result.into_result() {
                    Ok(()) => {
                        if response.request_op == ControlOpCode::RequestControl as u8 {
                            state.access = ControlAccess::Granted;
                            info!("Control granted");
                        } else if response.request_op == ControlOpCode::Reset as u8 {
                            state.access = ControlAccess::Unknown;
                        }
                        debug!("Control op {:#04x} succeeded", response.request_op);
                        Ok(response)
                    }
                    Err(e) => {
                        if e == ControlError::ControlNotPermitted {
                            state.access = ControlAccess::Unknown;
                        }
                        info!("Control op {:#04x} rejected: {}", response.request_op, e);
                        Err(FtmsError::Control(e))
                    }
                }
            }
        };

        // Sent under the lock so a racing timeout always finds the outcome.
        let _ = pending.completion.send(outcome);
        resolved
    }

    /// Fail the outstanding request and revoke control
    pub fn on_disconnect(&self) {
        let mut state = self.lock();
        state.access = ControlAccess::Revoked;
        if let Some(pending) = state.pending.take() {
            info!(
                "Failing control request {:#04x}: device disconnected",
                pending.op
            );
            let _ = pending.completion.send(Err(FtmsError::Disconnected));
        }
    }

    /// The machine reported that control was lost or reset
    pub fn on_control_lost(&self) {
        let mut state = self.lock();
        if state.access == ControlAccess::Granted {
            info!("Control permission lost");
            state.access = ControlAccess::Unknown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ble::testing::MockTransport,
        capability::{SettingKind, TargetSettings},
        CONTROL_POINT_UUID,
    };
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    fn speed_capabilities() -> Arc<CapabilitySet> {
        let mut feature = 0u32.to_le_bytes().to_vec();
        feature.extend_from_slice(&TargetSettings::SPEED.bits().to_le_bytes());
        let mut ranges = HashMap::new();
        // 0.00 .. 20.00 km/h
        ranges.insert(SettingKind::Speed, vec![0x00, 0x00, 0xD0, 0x07, 0x01, 0x00]);
        Arc::new(CapabilitySet::build(&feature, &ranges).unwrap())
    }

    fn control_point(timeout: Duration) -> (Arc<MockTransport>, ControlPoint) {
        let transport = Arc::new(MockTransport::default());
        let control = ControlPoint::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            CONTROL_POINT_UUID,
            speed_capabilities(),
            timeout,
        );
        (transport, control)
    }

    /// Answers the next write with the given result code
    async fn respond(
        control: &ControlPoint,
        writes: &mut mpsc::UnboundedReceiver<(Uuid, Vec<u8>)>,
        result: u8,
    ) -> Vec<u8> {
        let (_, data) = writes.recv().await.unwrap();
        control.on_indication(&[0x80, data[0], result]);
        data
    }

    #[tokio::test]
    async fn test_set_target_speed_success() {
        let (transport, control) = control_point(Duration::from_secs(2));
        let mut writes = transport.write_listener();

        let (outcome, written) = tokio::join!(
            control.submit(ControlRequest::SetTargetSpeed(20.0)),
            respond(&control, &mut writes, 0x01)
        );

        let response = assert_ok!(outcome);
        assert_eq!(response.request_op, 0x02);
        assert!(response.parameters.is_empty());
        assert_eq!(written, vec![0x02, 0xD0, 0x07]);
        assert_eq!(transport.writes()[0].0, CONTROL_POINT_UUID);
        assert!(control.is_idle());
    }

    #[tokio::test]
    async fn test_concurrent_submits_one_busy() {
        let (transport, control) = control_point(Duration::from_secs(2));
        let mut writes = transport.write_listener();

        let (first, second, _) = tokio::join!(
            control.submit(ControlRequest::RequestControl),
            control.submit(ControlRequest::Reset),
            respond(&control, &mut writes, 0x01)
        );

        let outcomes = [first, second];
        let busy = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Err(FtmsError::Busy { .. })))
            .count();
        let resolved = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
        assert_eq!(busy, 1);
        assert_eq!(resolved, 1);
        assert_eq!(transport.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_op_code_mismatch_returns_to_idle() {
        let (transport, control) = control_point(Duration::from_secs(2));
        let mut writes = transport.write_listener();

        let (outcome, _) = tokio::join!(control.submit(ControlRequest::RequestControl), async {
            writes.recv().await.unwrap();
            control.on_indication(&[0x80, 0x07, 0x01]);
        });

        assert!(matches!(
            outcome,
            Err(FtmsError::ProtocolMismatch {
                expected: 0x00,
                received: 0x07
            })
        ));
        assert!(control.is_idle());
        assert_eq!(control.access(), ControlAccess::Unknown);

        let (outcome, _) = tokio::join!(
            control.submit(ControlRequest::StartOrResume),
            respond(&control, &mut writes, 0x01)
        );
        assert_ok!(outcome);
    }

    #[tokio::test]
    async fn test_rejection_maps_result_code() {
        let (transport, control) = control_point(Duration::from_secs(2));
        let mut writes = transport.write_listener();

        let (outcome, _) = tokio::join!(
            control.submit(ControlRequest::SetTargetSpeed(5.0)),
            respond(&control, &mut writes, 0x03)
        );
        assert!(matches!(
            outcome,
            Err(FtmsError::Control(ControlError::InvalidParameter))
        ));
        assert!(control.is_idle());
    }

    #[tokio::test]
    async fn test_timeout_then_next_submit_accepted() {
        let (transport, control) = control_point(Duration::from_millis(50));
        let mut writes = transport.write_listener();

        let outcome = control.submit(ControlRequest::RequestControl).await;
        assert!(matches!(outcome, Err(FtmsError::Timeout { timeout_ms: 50 })));
        assert!(control.is_idle());
        writes.recv().await.unwrap();

        // A late answer to the timed out request is discarded
        assert!(control.on_indication(&[0x80, 0x00, 0x01]).is_none());
        assert_eq!(control.access(), ControlAccess::Unknown);

        let (outcome, _) = tokio::join!(
            control.submit(ControlRequest::RequestControl),
            respond(&control, &mut writes, 0x01)
        );
        assert_ok!(outcome);
        assert_eq!(control.access(), ControlAccess::Granted);
    }

    #[tokio::test]
    async fn test_stalled_write_times_out() {
        let (transport, control) = control_point(Duration::from_millis(50));
        transport.stall_writes(true);

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            control.submit(ControlRequest::RequestControl),
        )
        .await;
        let outcome = assert_ok!(outcome);
        assert!(matches!(outcome, Err(FtmsError::Timeout { timeout_ms: 50 })));
        assert!(control.is_idle());
        assert_eq!(transport.writes().len(), 1);

        transport.stall_writes(false);
        let mut writes = transport.write_listener();
        let (outcome, _) = tokio::join!(
            control.submit(ControlRequest::RequestControl),
            respond(&control, &mut writes, 0x01)
        );
        assert_ok!(outcome);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_and_revokes() {
        let (transport, control) = control_point(Duration::from_secs(2));
        let mut writes = transport.write_listener();

        let (outcome, _) = tokio::join!(control.submit(ControlRequest::RequestControl), async {
            writes.recv().await.unwrap();
            control.on_disconnect();
        });
        assert!(matches!(outcome, Err(FtmsError::Disconnected)));
        assert!(control.is_idle());
        assert_eq!(control.access(), ControlAccess::Revoked);

        let outcome = control.submit(ControlRequest::SetTargetSpeed(10.0)).await;
        assert!(matches!(outcome, Err(FtmsError::ControlNotAcquired)));

        let (outcome, _) = tokio::join!(
            control.submit(ControlRequest::RequestControl),
            respond(&control, &mut writes, 0x01)
        );
        assert_ok!(outcome);
        assert_eq!(control.access(), ControlAccess::Granted);
    }

    #[tokio::test]
    async fn test_validation_happens_before_write() {
        let (transport, control) = control_point(Duration::from_secs(2));

        assert!(matches!(
            control.submit(ControlRequest::SetTargetSpeed(25.0)).await,
            Err(FtmsError::OutOfRange { .. })
        ));
        assert!(matches!(
            control.submit(ControlRequest::SetTargetPower(100)).await,
            Err(FtmsError::NotSupported(_))
        ));
        assert!(transport.writes().is_empty());
        assert!(control.is_idle());
    }

    #[tokio::test]
    async fn test_write_failure_returns_to_idle() {
        let (transport, control) = control_point(Duration::from_secs(2));
        transport.fail_writes(true);

        let outcome = control.submit(ControlRequest::RequestControl).await;
        assert!(matches!(outcome, Err(FtmsError::Transport(_))));
        assert!(control.is_idle());
    }

    #[tokio::test]
    async fn test_abandoned_request_frees_control_point() {
        let (transport, control) = control_point(Duration::from_secs(2));
        let mut writes = transport.write_listener();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            control.submit(ControlRequest::RequestControl),
        )
        .await;
        assert_err!(abandoned);
        assert!(control.is_idle());
        writes.recv().await.unwrap();

        assert!(control.on_indication(&[0x80, 0x00, 0x01]).is_none());
        assert_eq!(control.access(), ControlAccess::Unknown);

        let (outcome, _) = tokio::join!(
            control.submit(ControlRequest::Reset),
            respond(&control, &mut writes, 0x01)
        );
        assert_ok!(outcome);
    }

    #[tokio::test]
    async fn test_control_lost_resets_access() {
        let (transport, control) = control_point(Duration::from_secs(2));
        let mut writes = transport.write_listener();

        let (outcome, _) = tokio::join!(
            control.submit(ControlRequest::RequestControl),
            respond(&control, &mut writes, 0x01)
        );
        assert_ok!(outcome);
        assert_eq!(control.access(), ControlAccess::Granted);

        control.on_control_lost();
        assert_eq!(control.access(), ControlAccess::Unknown);
    }
}
