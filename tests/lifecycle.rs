//! End-to-end controller walk over the simulated fabric: bind two ports on
//! one pool, attach, partition rings across workers, forward traffic, shut
//! down, release, detach.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use ringswitch::sim::{SimFabric, SimNicSpec};
use ringswitch::{
    Error, ForwardPolicy, PacketView, Port, PortId, ShutdownToken, Switch, Worker, WorkerState,
};

const RINGS: u16 = 4;
const SLOTS: u32 = 64;
const LEFT: PortId = PortId::new(0);
const RIGHT: PortId = PortId::new(1);

fn provision(fabric: &SimFabric, name: &str) {
    fabric.provision(
        name,
        SimNicSpec {
            queues: RINGS,
            buf_size: 512,
            pool_bufs: 0,
        },
    );
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

struct Cross;

impl ForwardPolicy for Cross {
    fn decide(&self, src: PortId, _pkt: &PacketView<'_>) -> PortId {
        if src == LEFT { RIGHT } else { LEFT }
    }
}

#[test]
fn full_switch_lifecycle() {
    let fabric = Arc::new(SimFabric::new());
    provision(&fabric, "sim0");
    provision(&fabric, "sim1");

    // two ports, the second anchored on the first's pool
    let left = Port::create(fabric.as_ref(), "sim0", RINGS, SLOTS, None).unwrap();
    let right = Port::create(fabric.as_ref(), "sim1", RINGS, SLOTS, Some(&left)).unwrap();
    assert_eq!(left.ring_count(), RINGS);
    assert_eq!(left.region().id(), right.region().id());
    assert_eq!(fabric.open_count("sim0"), RINGS as usize);
    assert_eq!(fabric.open_count("sim1"), RINGS as usize);

    let mut sw = Switch::new();
    sw.attach(left, LEFT).unwrap();
    sw.attach(right, RIGHT).unwrap();
    assert_eq!(sw.len(), 2);

    // partition: worker w owns queue w of both ports
    let shutdown = ShutdownToken::new();
    let (ev_tx, ev_rx) = mpsc::channel();
    let policy: Arc<dyn ForwardPolicy> = Arc::new(Cross);
    let mut handles = Vec::new();
    for w in 0..RINGS {
        let grants = vec![
            (LEFT, sw.claim(LEFT, w).unwrap()),
            (RIGHT, sw.claim(RIGHT, w).unwrap()),
        ];
        let worker = Worker::new(
            w as u8,
            grants,
            policy.clone(),
            shutdown.clone(),
            ev_tx.clone(),
        )
        .unwrap();
        handles.push(worker.spawn().unwrap());
    }
    drop(ev_tx);
    assert_eq!(sw.port(LEFT).unwrap().refs(), RINGS as u32);

    // a claimed ring cannot be claimed again, so worker sets are disjoint
    assert!(matches!(sw.claim(LEFT, 0), Err(Error::Busy(_))));
    // ... and a referenced port cannot be detached
    assert!(matches!(sw.detach("sim0"), Err(Error::Busy(_))));

    // traffic through every queue, both directions
    for q in 0..RINGS {
        fabric.inject("sim0", q, format!("l{q}").as_bytes()).unwrap();
        fabric.inject("sim1", q, format!("r{q}").as_bytes()).unwrap();
    }
    for q in 0..RINGS {
        let mut out = None;
        assert!(wait_until(|| {
            out = fabric.harvest("sim1", q).unwrap();
            out.is_some()
        }));
        assert_eq!(out.unwrap(), format!("l{q}").into_bytes());
        let mut back = None;
        assert!(wait_until(|| {
            back = fabric.harvest("sim0", q).unwrap();
            back.is_some()
        }));
        assert_eq!(back.unwrap(), format!("r{q}").into_bytes());
    }
    assert!(wait_until(|| {
        let forwarded: u64 = handles
            .iter()
            .map(|h| h.counters().forwarded.load(Ordering::Relaxed))
            .sum();
        forwarded == RINGS as u64 * 2
    }));

    // shutdown is one-shot and idempotent
    shutdown.signal();
    shutdown.signal();
    for handle in handles {
        assert!(wait_until(|| handle.state() == WorkerState::Terminated));
        let grants = handle.join().unwrap();
        assert_eq!(grants.len(), 2);
        for (id, grant) in grants {
            sw.release(id, grant).unwrap();
        }
    }
    assert_eq!(sw.port(LEFT).unwrap().refs(), 0);
    assert!(ev_rx.try_recv().is_err(), "no failures expected");

    // references drained; detach succeeds and the table empties
    let left = sw.detach("sim0").unwrap();
    let right = sw.detach("sim1").unwrap();
    assert_eq!(sw.len(), 0);
    drop(left);
    drop(right);
    assert_eq!(fabric.open_count("sim0"), 0);
    assert_eq!(fabric.open_count("sim1"), 0);
}

#[test]
fn failed_bind_leaves_no_descriptors() {
    let fabric = SimFabric::new();
    provision(&fabric, "sim0");
    fabric.fail_queue("sim0", RINGS - 1);
    assert!(matches!(
        Port::create(&fabric, "sim0", RINGS, SLOTS, None),
        Err(Error::Open { .. })
    ));
    assert_eq!(fabric.open_count("sim0"), 0);
    // the fault was one-shot; binding works afterwards
    let port = Port::create(&fabric, "sim0", RINGS, SLOTS, None).unwrap();
    assert_eq!(fabric.open_count("sim0"), RINGS as usize);
    drop(port);
    assert_eq!(fabric.open_count("sim0"), 0);
}

#[test]
fn broadcast_copies_to_every_other_port() {
    let fabric = Arc::new(SimFabric::new());
    for name in ["sim0", "sim1", "sim2"] {
        provision(&fabric, name);
    }
    let a = Port::create(fabric.as_ref(), "sim0", 1, SLOTS, None).unwrap();
    let b = Port::create(fabric.as_ref(), "sim1", 1, SLOTS, None).unwrap();
    let c = Port::create(fabric.as_ref(), "sim2", 1, SLOTS, None).unwrap();
    let mut sw = Switch::new();
    sw.attach(a, PortId::new(0)).unwrap();
    sw.attach(b, PortId::new(1)).unwrap();
    sw.attach(c, PortId::new(2)).unwrap();

    let shutdown = ShutdownToken::new();
    let (ev_tx, _ev_rx) = mpsc::channel();
    let policy: Arc<dyn ForwardPolicy> =
        Arc::new(|_: PortId, _: &PacketView<'_>| PortId::BROADCAST);
    let grants = vec![
        (PortId::new(0), sw.claim(PortId::new(0), 0).unwrap()),
        (PortId::new(1), sw.claim(PortId::new(1), 0).unwrap()),
        (PortId::new(2), sw.claim(PortId::new(2), 0).unwrap()),
    ];
    let handle = Worker::new(0, grants, policy, shutdown.clone(), ev_tx)
        .unwrap()
        .spawn()
        .unwrap();

    fabric.inject("sim0", 0, b"flood").unwrap();
    for name in ["sim1", "sim2"] {
        let mut out = None;
        assert!(wait_until(|| {
            out = fabric.harvest(name, 0).unwrap();
            out.is_some()
        }));
        assert_eq!(out.unwrap(), b"flood");
    }
    assert!(fabric.harvest("sim0", 0).unwrap().is_none());

    shutdown.signal();
    for (id, grant) in handle.join().unwrap() {
        sw.release(id, grant).unwrap();
    }
}
