// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! treefence-sim - Fence round simulator
//!
//! Runs N node agents in one process on a loopback control plane, optionally
//! with real localhost direct connections, and drives R fence rounds.

use clap::Parser;
use std::net::IpAddr;
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use treefence::{
    ControlPlane, DeliveryMode, FenceAgent, FenceConfig, FenceError, JobLayout, LogOnlyControl,
    LoopbackNetwork, MetricsSnapshot, NodeContext, ParticipantSet, StaticLayout,
};

const NAMESPACE: &str = "sim";

/// treefence round simulator
#[derive(Parser, Debug)]
#[command(name = "treefence-sim")]
#[command(version = "0.1.0")]
#[command(about = "Simulate tree fence rounds across in-process node agents")]
struct Args {
    /// Number of nodes (one rank each)
    #[arg(short, long, default_value = "8")]
    nodes: usize,

    /// Tree fan-out
    #[arg(short, long, default_value = "2")]
    width: u32,

    /// Number of fence rounds
    #[arg(short, long, default_value = "10")]
    rounds: usize,

    /// Contribution size per node in bytes
    #[arg(short, long, default_value = "64")]
    payload: usize,

    /// Use direct localhost connections between tree neighbours
    #[arg(short, long)]
    direct: bool,

    /// Per-round timeout in seconds
    #[arg(short, long, default_value = "30")]
    timeout: u64,
}

type Outcome = core::result::Result<Vec<u8>, FenceError>;

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.nodes == 0 {
        return Err("--nodes must be at least 1".into());
    }

    println!(
        "=== treefence: {} nodes, width {}, {} rounds, {} B payload, {} ===\n",
        args.nodes,
        args.width,
        args.rounds,
        args.payload,
        if args.direct { "direct" } else { "indirect" }
    );

    let timeout = Duration::from_secs(args.timeout);
    let net = LoopbackNetwork::new(DeliveryMode::Immediate);
    let agents = launch(args, &net, timeout)?;
    let set = ParticipantSet::ranks(NAMESPACE, args.nodes as u32);

    let result = drive(args, &agents, &set, timeout);

    let mut total = MetricsSnapshot::default();
    for agent in &agents {
        total.merge(&agent.metrics());
        agent.shutdown();
    }
    print_metrics(&total);
    result
}

fn launch(
    args: &Args,
    net: &Arc<LoopbackNetwork>,
    timeout: Duration,
) -> Result<Vec<Arc<FenceAgent>>, Box<dyn std::error::Error>> {
    let layout: Arc<dyn JobLayout> = Arc::new(StaticLayout::localhost(NAMESPACE, args.nodes));
    let localhost: IpAddr = IpAddr::from([127, 0, 0, 1]);
    let mut config = FenceConfig::from_env()
        .with_tree_width(args.width)
        .with_timeout(timeout)
        .with_direct_conn(args.direct);
    if args.direct {
        config = config.with_listen(Some(localhost), 0);
    }
    config.validate()?;

    let mut agents = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let host = format!("node{}", i);
        let ctx = NodeContext::new(
            host.as_str(),
            config.clone(),
            layout.clone(),
            Arc::new(LogOnlyControl),
        )?;
        let plane: Arc<dyn ControlPlane> = net.clone();
        let agent = FenceAgent::launch(ctx, plane)?;
        net.attach(host, agent.sink());
        if let Some(addr) = agent.listen_addr() {
            log::debug!("[sim] node{} listening on {}", i, addr);
        }
        agents.push(agent);
    }
    Ok(agents)
}

fn drive(
    args: &Args,
    agents: &[Arc<FenceAgent>],
    set: &ParticipantSet,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut latencies = Vec::with_capacity(args.rounds);

    for round in 0..args.rounds {
        let (tx, rx) = mpsc::channel::<(usize, Outcome)>();
        let start = Barrier::new(agents.len());
        let started = Instant::now();

        thread::scope(|s| -> Result<(), treefence::Error> {
            let handles: Vec<_> = agents
                .iter()
                .enumerate()
                .map(|(i, agent)| {
                    let tx = tx.clone();
                    let start = &start;
                    let data = contribution(i, round, args.payload);
                    s.spawn(move || {
                        start.wait();
                        agent
                            .begin_fence(set, &data, move |r| {
                                let _ = tx.send((i, r));
                            })
                            .map(|_| ())
                    })
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(r) => r?,
                    Err(_) => return Err(treefence::Error::Shutdown),
                }
            }
            Ok(())
        })?;
        drop(tx);

        let mut outcomes: Vec<Option<Outcome>> = vec![None; agents.len()];
        let deadline = started + timeout + Duration::from_secs(1);
        for _ in 0..agents.len() {
            let wait = deadline.saturating_duration_since(Instant::now());
            let (node, outcome) = rx
                .recv_timeout(wait)
                .map_err(|_| format!("round {}: not every node completed", round))?;
            outcomes[node] = Some(outcome);
        }
        let elapsed = started.elapsed();

        validate(round, &outcomes, args.payload)?;
        settle(agents, set, round, deadline)?;

        println!("  round {:>4}: {:>10.3} ms", round, elapsed.as_secs_f64() * 1000.0);
        latencies.push(elapsed);
    }

    if !latencies.is_empty() {
        latencies.sort();
        let sum: Duration = latencies.iter().sum();
        let mean = sum / latencies.len() as u32;
        println!(
            "\nLatency: min {:.3} ms, mean {:.3} ms, max {:.3} ms",
            latencies[0].as_secs_f64() * 1000.0,
            mean.as_secs_f64() * 1000.0,
            latencies[latencies.len() - 1].as_secs_f64() * 1000.0
        );
    }
    Ok(())
}

/// Every node must receive the same aggregate holding every contribution.
fn validate(
    round: usize,
    outcomes: &[Option<Outcome>],
    payload: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut reference: Option<&[u8]> = None;
    for (node, outcome) in outcomes.iter().enumerate() {
        let data = match outcome {
            Some(Ok(data)) => data.as_slice(),
            Some(Err(e)) => return Err(format!("round {}: node{} failed: {}", round, node, e).into()),
            None => return Err(format!("round {}: node{} missing", round, node).into()),
        };
        match reference {
            None => reference = Some(data),
            Some(r) if r != data => {
                return Err(format!("round {}: node{} aggregate differs", round, node).into())
            }
            Some(_) => {}
        }
    }
    let expected = outcomes.len() * payload;
    match reference {
        Some(r) if r.len() != expected => Err(format!(
            "round {}: aggregate is {} bytes, expected {}",
            round,
            r.len(),
            expected
        )
        .into()),
        _ => Ok(()),
    }
}

/// Wait for every collective to move past `round` before starting the next.
fn settle(
    agents: &[Arc<FenceAgent>],
    set: &ParticipantSet,
    round: usize,
    deadline: Instant,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let done = agents.iter().all(|a| {
            a.collective(set)
                .map(|c| c.seq() as usize > round)
                .unwrap_or(false)
        });
        if done {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(format!("round {}: collectives did not settle", round).into());
        }
        thread::sleep(Duration::from_micros(200));
    }
}

fn contribution(node: usize, round: usize, size: usize) -> Vec<u8> {
    let tag = (node as u8) ^ (round as u8).rotate_left(3);
    vec![tag; size]
}

fn print_metrics(m: &MetricsSnapshot) {
    println!("\n=== Metrics (all nodes) ===");
    println!("  fences started:       {}", m.fences_started);
    println!("  fences completed:     {}", m.fences_completed);
    println!("  fences failed:        {}", m.fences_failed);
    println!("  timeouts:             {}", m.timeouts);
    println!("  duplicates dropped:   {}", m.duplicates_dropped);
    println!("  stale dropped:        {}", m.stale_dropped);
    println!("  protocol errors:      {}", m.protocol_errors);
    println!("  upward bytes:         {}", m.upward_bytes);
    println!("  downward bytes:       {}", m.downward_bytes);
    println!("  indirect sends:       {}", m.indirect_sends);
    println!("  direct sends:         {}", m.direct_sends);
    println!("  send retries:         {}", m.send_retries);
    println!("  send failures:        {}", m.send_failures);
    println!("  inline completions:   {}", m.inline_completions);
    println!("  deferred completions: {}", m.deferred_completions);
    println!("  direct established:   {}", m.direct_established);
    println!("  direct closed:        {}", m.direct_closed);
    println!("  success rate:         {:.1}%", m.success_rate() * 100.0);
}
