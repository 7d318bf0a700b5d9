//! Demo controller: two simulated NICs sharing one buffer pool, wired back
//! to back, with a worker pool cross-forwarding between them until Ctrl-C.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use etherparse::{NetHeaders, PacketBuilder, PacketHeaders};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ringswitch::sim::{SimFabric, SimNicSpec};
use ringswitch::{
    ForwardPolicy, PacketView, Port, PortId, ShutdownToken, Switch, Worker,
};

const LEFT: PortId = PortId::new(0);
const RIGHT: PortId = PortId::new(1);

/// Command line options.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// First interface name.
    #[clap(long, default_value = "sim0")]
    left: String,

    /// Second interface name.
    #[clap(long, default_value = "sim1")]
    right: String,

    /// Hardware queues per interface.
    #[clap(short, long, default_value_t = 8)]
    rings: u16,

    /// Slots per ring.
    #[clap(short, long, default_value_t = 1024)]
    slots: u32,

    /// Worker threads (default: one per ring, capped at the CPU count).
    #[clap(short, long)]
    workers: Option<usize>,

    /// Frames seeded into the loop at startup.
    #[clap(short, long, default_value_t = 64)]
    frames: u32,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[clap(short, long)]
    duration: Option<u64>,

    /// Print parsed addresses for every forwarded frame.
    #[clap(long)]
    debug: bool,
}

/// Everything from the left port goes right and vice versa; the forwarding
/// decision proper is outside the resource layer, this is the simplest
/// stand-in.
struct CrossPolicy {
    debug: bool,
}

impl ForwardPolicy for CrossPolicy {
    fn decide(&self, src: PortId, pkt: &PacketView<'_>) -> PortId {
        if self.debug {
            if let Some(info) = describe(pkt.frame) {
                println!("port {src} queue {}: {info}", pkt.queue);
            }
        }
        if src == LEFT { RIGHT } else { LEFT }
    }
}

/// Try to parse Ethernet/IP headers and return a formatted string.
fn describe(frame: &[u8]) -> Option<String> {
    let headers = PacketHeaders::from_ethernet_slice(frame).ok()?;
    match headers.net? {
        NetHeaders::Ipv4(hdr, _) => Some(format!(
            "IP: {} > {}",
            Ipv4Addr::from(hdr.source),
            Ipv4Addr::from(hdr.destination)
        )),
        NetHeaders::Ipv6(hdr, _) => Some(format!(
            "IP: {} > {}",
            Ipv6Addr::from(hdr.source),
            Ipv6Addr::from(hdr.destination)
        )),
        _ => None,
    }
}

fn build_frame(seq: u32) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(4000, 4001);
    let payload = seq.to_be_bytes();
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, &payload).expect("frame build");
    frame
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    println!("switch demo started with parameters:");
    println!("* interfaces: {} <-> {}", args.left, args.right);
    println!("* rings: {}", args.rings);
    println!("* slots: {}", args.slots);
    println!("* debug: {}", if args.debug { "ON" } else { "OFF" });

    let shutdown = ShutdownToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.signal()).expect("Error setting Ctrl-C handler");
    }

    let fabric = Arc::new(SimFabric::new());
    for name in [&args.left, &args.right] {
        fabric.provision(
            name,
            SimNicSpec {
                queues: args.rings,
                buf_size: 2048,
                pool_bufs: 0,
            },
        );
    }
    fabric.wire(&args.left, &args.right)?;

    let mut sw = Switch::new();
    let left = Port::create(fabric.as_ref(), &args.left, args.rings, args.slots, None)
        .with_context(|| format!("binding {}", args.left))?;
    // share the left port's pool so the cross-forwarding hand-off stays
    // zero-copy
    let right = Port::create(fabric.as_ref(), &args.right, args.rings, args.slots, Some(&left))
        .with_context(|| format!("binding {}", args.right))?;
    info!(
        region = left.region().id(),
        rings = args.rings,
        "ports bound on one pool"
    );
    sw.attach(left, LEFT)?;
    sw.attach(right, RIGHT)?;

    let nworkers = args
        .workers
        .unwrap_or_else(|| (args.rings as usize).min(num_cpus::get()))
        .clamp(1, 253);
    let policy = Arc::new(CrossPolicy { debug: args.debug });
    let (ev_tx, ev_rx) = mpsc::channel();
    let mut handles = Vec::with_capacity(nworkers);
    for w in 0..nworkers {
        // worker w owns queue w, w+n, ... of both ports; no ring is owned
        // twice
        let mut grants = Vec::new();
        for q in (w..args.rings as usize).step_by(nworkers) {
            grants.push((LEFT, sw.claim(LEFT, q as u16)?));
            grants.push((RIGHT, sw.claim(RIGHT, q as u16)?));
        }
        let worker = Worker::new(
            w as u8,
            grants,
            policy.clone(),
            shutdown.clone(),
            ev_tx.clone(),
        )?;
        handles.push(worker.spawn()?);
    }
    drop(ev_tx);
    println!("* workers: {nworkers}");

    let pump = {
        let fabric = fabric.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || fabric.pump_loop(&shutdown))
    };

    // seed the loop; every frame keeps circulating until shutdown
    for seq in 0..args.frames {
        let frame = build_frame(seq);
        fabric.inject(&args.left, (seq % args.rings as u32) as u16, &frame)?;
    }

    let stats = {
        let counters: Vec<_> = handles.iter().map(|h| h.counters()).collect();
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            let mut old_total = 0u64;
            while !shutdown.is_signaled() {
                thread::sleep(Duration::from_secs(1));
                let total: u64 = counters
                    .iter()
                    .map(|c| c.forwarded.load(Ordering::Relaxed))
                    .sum();
                println!("Aggregated pkt/sec: {}", total.saturating_sub(old_total));
                old_total = total;
            }
        })
    };

    if let Some(secs) = args.duration {
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(secs));
            shutdown.signal();
        });
    }

    // the controller sits on the event channel until shutdown
    while !shutdown.is_signaled() {
        match ev_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(event) => warn!(?event, "worker reported ring failure"),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    shutdown.signal();

    let mut forwarded = 0u64;
    for handle in handles {
        forwarded += handle.counters().forwarded.load(Ordering::Relaxed);
        let grants = handle.join().expect("worker panicked");
        for (id, grant) in grants {
            sw.release(id, grant)?;
        }
    }
    pump.join().expect("pump thread panicked");
    stats.join().expect("stats thread panicked");

    let left = sw.detach(&args.left)?;
    let right = sw.detach(&args.right)?;
    drop(left);
    drop(right);
    println!("Total forwarded: {forwarded}");
    Ok(())
}
