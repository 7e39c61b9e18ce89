//! Send plan dispatch
//!
//! Plans are handed to the Tokio runtime once the original packet has its
//! verdict, so a worker never waits on plan delays. Steps of one plan go
//! out strictly in order.

use crate::traits::PacketSink;
use desync_core::SendPlan;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Outcome of sending one plan
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Packets handed to the sink successfully
    pub sent: usize,
    /// Packets the sink rejected
    pub failed: usize,
}

/// Send every step of `plan` in order, honouring per-step delays.
///
/// A failed step is logged and skipped; the rest of the plan still goes
/// out.
pub async fn deliver(plan: SendPlan, sink: &dyn PacketSink, mtu: usize) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for (index, emit) in plan.into_iter().enumerate() {
        if !emit.delay.is_zero() {
            tokio::time::sleep(emit.delay).await;
        }
        match sink.send_with_mtu(&emit.packet, mtu) {
            Ok(()) => report.sent += 1,
            Err(e) => {
                warn!(step = index, error = %e, "injection failed");
                report.failed += 1;
            }
        }
    }
    trace!(sent = report.sent, failed = report.failed, "plan delivered");
    report
}

/// Fire-and-forget plan sender bound to a runtime
#[derive(Clone)]
pub struct PlanDispatcher {
    runtime: Handle,
    sink: Arc<dyn PacketSink>,
    mtu: usize,
}

impl std::fmt::Debug for PlanDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanDispatcher").field("mtu", &self.mtu).finish_non_exhaustive()
    }
}

impl PlanDispatcher {
    /// Create a dispatcher sending through `sink` on `runtime`
    pub fn new(runtime: Handle, sink: Arc<dyn PacketSink>, mtu: usize) -> Self {
        Self { runtime, sink, mtu }
    }

    /// Spawn delivery of `plan`. The handle may be dropped.
    pub fn dispatch(&self, plan: SendPlan) -> JoinHandle<DeliveryReport> {
        let sink = Arc::clone(&self.sink);
        let mtu = self.mtu;
        self.runtime
            .spawn(async move { deliver(plan, sink.as_ref(), mtu).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::traits::MockPacketSink;
    use desync_core::packet::{Direction, Packet, PacketBuilder, TcpFlags};
    use desync_core::strategies::Emit;
    use std::sync::Mutex;
    use std::time::Duration;

    fn packet(ttl: u8) -> Packet {
        let bytes = PacketBuilder::tcp_v4()
            .src_ip_v4([10, 0, 0, 1])
            .dst_ip_v4([10, 0, 0, 2])
            .dst_port(443)
            .ttl(ttl)
            .flags(TcpFlags::data())
            .payload(b"x")
            .build();
        Packet::from_bytes(&bytes, Direction::Outbound).unwrap()
    }

    fn plan(steps: Vec<Emit>) -> SendPlan {
        let mut plan = SendPlan::new();
        for step in steps {
            plan.push(step);
        }
        plan
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_preserves_order_and_delays() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        let mut sink = MockPacketSink::new();
        sink.expect_send_with_mtu()
            .times(3)
            .returning(move |p, mtu| {
                assert_eq!(mtu, 1500);
                log.lock().unwrap().push((p.ttl, tokio::time::Instant::now()));
                Ok(())
            });

        let start = tokio::time::Instant::now();
        let report = deliver(
            plan(vec![
                Emit::now(packet(1)),
                Emit::after(packet(2), Duration::from_millis(10)),
                Emit::after(packet(3), Duration::from_millis(5)),
            ]),
            &sink,
            1500,
        )
        .await;

        assert_eq!(report, DeliveryReport { sent: 3, failed: 0 });
        let sent = sent.lock().unwrap();
        let ttls: Vec<u8> = sent.iter().map(|(ttl, _)| *ttl).collect();
        assert_eq!(ttls, vec![1, 2, 3]);
        assert!(sent[2].1 - start >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_failed_step_does_not_abort_plan() {
        let mut sink = MockPacketSink::new();
        let mut seq = mockall::Sequence::new();
        sink.expect_send_with_mtu()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|p, _| {
                Err(PlatformError::Injection {
                    dst: p.dst_addr,
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                })
            });
        sink.expect_send_with_mtu()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let report = deliver(
            plan(vec![Emit::now(packet(3)), Emit::now(packet(64))]),
            &sink,
            1500,
        )
        .await;
        assert_eq!(report, DeliveryReport { sent: 1, failed: 1 });
    }

    #[test]
    fn test_dispatch_runs_on_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let mut sink = MockPacketSink::new();
        sink.expect_send_with_mtu().times(2).returning(|_, _| Ok(()));

        let dispatcher = PlanDispatcher::new(runtime.handle().clone(), Arc::new(sink), 1400);
        let handle = dispatcher.dispatch(plan(vec![Emit::now(packet(1)), Emit::now(packet(2))]));
        let report = runtime.block_on(handle).unwrap();
        assert_eq!(report.sent, 2);
    }
}
