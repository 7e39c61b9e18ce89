//! Integration tests for the worker pool using in-memory queues

use desync_core::config::{Config, ConfigHandle, StrategyFamily};
use desync_core::packet::{Direction, Packet, PacketBuilder, TcpFlags};
use desync_core::tls::ClientHelloBuilder;
use desync_platform::{
    CapturedPacket, PacketQueue, PacketSink, PlatformError, QueueVerdict, Result, WorkerPool,
    IDLE_POLL,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Queue fed from a fixed list of packets
struct MemoryQueue {
    number: u16,
    incoming: VecDeque<CapturedPacket>,
    verdicts: Arc<Mutex<Vec<QueueVerdict>>>,
}

impl PacketQueue for MemoryQueue {
    type Packet = CapturedPacket;

    fn number(&self) -> u16 {
        self.number
    }

    fn recv(&mut self) -> Result<Option<CapturedPacket>> {
        match self.incoming.pop_front() {
            Some(packet) => Ok(Some(packet)),
            None => {
                std::thread::sleep(Duration::from_millis(2));
                Ok(None)
            }
        }
    }

    fn verdict(&mut self, _packet: CapturedPacket, verdict: QueueVerdict) -> Result<()> {
        self.verdicts.lock().unwrap().push(verdict);
        Ok(())
    }
}

/// Queue that never blocks: an empty read returns at once, packets can
/// be pushed while the worker runs
struct NonblockingQueue {
    number: u16,
    incoming: Arc<Mutex<VecDeque<CapturedPacket>>>,
    empty_reads: Arc<AtomicUsize>,
    verdicts: Arc<Mutex<Vec<QueueVerdict>>>,
}

impl PacketQueue for NonblockingQueue {
    type Packet = CapturedPacket;

    fn number(&self) -> u16 {
        self.number
    }

    fn recv(&mut self) -> Result<Option<CapturedPacket>> {
        let packet = self.incoming.lock().unwrap().pop_front();
        if packet.is_none() {
            self.empty_reads.fetch_add(1, Ordering::Relaxed);
        }
        Ok(packet)
    }

    fn verdict(&mut self, _packet: CapturedPacket, verdict: QueueVerdict) -> Result<()> {
        self.verdicts.lock().unwrap().push(verdict);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Packet>>,
}

impl PacketSink for RecordingSink {
    fn send(&self, packet: &Packet) -> Result<()> {
        self.sent.lock().unwrap().push(packet.clone());
        Ok(())
    }

    fn send_with_mtu(&self, packet: &Packet, _mtu: usize) -> Result<()> {
        self.send(packet)
    }
}

fn hello(host: &str) -> Vec<u8> {
    PacketBuilder::tcp_v4()
        .src_ip_v4([192, 168, 1, 100])
        .dst_ip_v4([93, 184, 216, 34])
        .src_port(51000)
        .dst_port(443)
        .seq(1)
        .flags(TcpFlags::data())
        .payload(&ClientHelloBuilder::new(host).build_record())
        .build()
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn single_queue_config(domain: &str) -> Arc<ConfigHandle> {
    let mut config = Config::from_family(StrategyFamily::TcpFrag, vec![domain.into()]);
    config.queue.threads = 1;
    Arc::new(ConfigHandle::new(config).unwrap())
}

#[test]
fn test_pool_drops_match_and_sends_plan() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let verdicts = Arc::new(Mutex::new(Vec::new()));

    let queued = Arc::new(Mutex::new(Some(VecDeque::from(vec![
        CapturedPacket::outbound(hello("example.org")),
        CapturedPacket::outbound(hello("www.blocked.example")),
    ]))));
    let verdict_log = Arc::clone(&verdicts);
    let pool = WorkerPool::spawn(
        single_queue_config("blocked.example"),
        sink.clone(),
        runtime.handle().clone(),
        CancellationToken::new(),
        move |number| {
            Ok(MemoryQueue {
                number,
                incoming: queued.lock().unwrap().take().unwrap_or_default(),
                verdicts: Arc::clone(&verdict_log),
            })
        },
    )
    .unwrap();
    assert_eq!(pool.len(), 1);

    assert!(wait_for(Duration::from_secs(5), || sink.sent.lock().unwrap().len() >= 2));
    let stats = pool.stop();

    assert_eq!(
        *verdicts.lock().unwrap(),
        vec![QueueVerdict::Accept, QueueVerdict::Drop]
    );
    assert_eq!(stats.packets_processed, 2);
    assert_eq!(stats.plans_built, 1);

    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|p| p.direction == Direction::Outbound && p.checksums_valid()));
}

#[test]
fn test_pool_fails_when_a_queue_cannot_open() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut config = Config::from_family(StrategyFamily::TcpFrag, vec!["a.example".into()]);
    config.queue.start = 10;
    config.queue.threads = 3;
    let handle = Arc::new(ConfigHandle::new(config).unwrap());

    let result = WorkerPool::spawn(
        handle,
        Arc::new(RecordingSink::default()),
        runtime.handle().clone(),
        CancellationToken::new(),
        |number| {
            if number == 11 {
                return Err(PlatformError::fatal(
                    format!("nfqueue {number}: bind"),
                    std::io::Error::from(std::io::ErrorKind::AddrInUse),
                ));
            }
            Ok(MemoryQueue {
                number,
                incoming: VecDeque::new(),
                verdicts: Arc::new(Mutex::new(Vec::new())),
            })
        },
    );

    let err = result.unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("nfqueue 11"));
}

#[test]
fn test_cancelled_token_stops_pool() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let token = CancellationToken::new();
    let pool = WorkerPool::spawn(
        single_queue_config("a.example"),
        Arc::new(RecordingSink::default()),
        runtime.handle().clone(),
        token.clone(),
        |number| {
            Ok(MemoryQueue {
                number,
                incoming: VecDeque::new(),
                verdicts: Arc::new(Mutex::new(Vec::new())),
            })
        },
    )
    .unwrap();

    token.cancel();
    assert!(wait_for(Duration::from_secs(5), || pool.any_finished()));
    assert_eq!(pool.stop(), desync_core::Stats::default());
}

#[test]
fn test_idle_nonblocking_queue_is_polled_at_a_bounded_rate() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let incoming = Arc::new(Mutex::new(VecDeque::new()));
    let empty_reads = Arc::new(AtomicUsize::new(0));
    let verdicts = Arc::new(Mutex::new(Vec::new()));

    let (queue_in, reads, verdict_log) =
        (Arc::clone(&incoming), Arc::clone(&empty_reads), Arc::clone(&verdicts));
    let started = Instant::now();
    let pool = WorkerPool::spawn(
        single_queue_config("blocked.example"),
        Arc::new(RecordingSink::default()),
        runtime.handle().clone(),
        CancellationToken::new(),
        move |number| {
            Ok(NonblockingQueue {
                number,
                incoming: Arc::clone(&queue_in),
                empty_reads: Arc::clone(&reads),
                verdicts: Arc::clone(&verdict_log),
            })
        },
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(100));
    incoming
        .lock()
        .unwrap()
        .push_back(CapturedPacket::outbound(hello("example.org")));
    assert!(wait_for(Duration::from_secs(5), || !verdicts.lock().unwrap().is_empty()));
    assert!(!pool.any_finished());

    let stats = pool.stop();
    let elapsed = started.elapsed();
    assert_eq!(stats.packets_processed, 1);
    assert_eq!(*verdicts.lock().unwrap(), vec![QueueVerdict::Accept]);

    let polls = empty_reads.load(Ordering::Relaxed);
    let ceiling = (elapsed.as_micros() / IDLE_POLL.as_micros()) as usize + 1;
    assert!(polls >= 1);
    assert!(polls <= ceiling, "{polls} empty reads in {elapsed:?}");
}
