use clap::{App, Arg};
use colored::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use swarmlink::bus::{now_millis, InMemoryBus, SwarmBus};
use swarmlink::config::SwarmFlags;
use swarmlink::model::{AgentId, AgentRole, HealthSummary, SwarmConfig, CONSTELLATION_TAG, SIGNATURE_LEN};
use swarmlink::SwarmAgent;
use tokio::time;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("swarmlink-simulator")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("🛰️  Swarmlink constellation simulator - in-process multi-agent coordination run")
        .arg(
            Arg::with_name("agents")
                .short("n")
                .long("agents")
                .value_name("COUNT")
                .help("Number of satellite agents to simulate")
                .takes_value(true)
                .default_value("5"),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("SECONDS")
                .help("Simulation duration in seconds")
                .takes_value(true)
                .default_value("20"),
        )
        .arg(
            Arg::with_name("heartbeat-ms")
                .long("heartbeat-ms")
                .value_name("MS")
                .help("Heartbeat interval in milliseconds (accelerated for simulation)")
                .takes_value(true)
                .default_value("1000"),
        )
        .get_matches();

    let agent_count: usize = matches.value_of("agents").unwrap_or("5").parse()?;
    let duration_s: u64 = matches.value_of("duration").unwrap_or("20").parse()?;
    let heartbeat_ms: u64 = matches.value_of("heartbeat-ms").unwrap_or("1000").parse()?;

    println!("🛰️  {}", "Swarmlink Constellation Simulator".bold());
    println!("=====================================");
    println!("   Agents:    {}", agent_count);
    println!("   Duration:  {}s", duration_s);
    println!("   Heartbeat: {}ms", heartbeat_ms);

    let bus = Arc::new(InMemoryBus::new());
    let mut flags = SwarmFlags::from_env();
    flags.swarm_mode = true;

    let heartbeat = Duration::from_millis(heartbeat_ms);
    let timeout = heartbeat * 3;
    let broadcast_period = heartbeat * 2;

    let mut agents = Vec::with_capacity(agent_count);
    for i in 0..agent_count {
        let id = AgentId::new(&format!("SAT-{:03}", i + 1))?;
        let role = if i == 0 { AgentRole::Primary } else { AgentRole::Backup };
        let config = SwarmConfig::new(id, role, CONSTELLATION_TAG, vec![], 10)?;
        let agent = Arc::new(SwarmAgent::with_timing(
            config,
            flags.clone(),
            Arc::clone(&bus) as Arc<dyn SwarmBus>,
            heartbeat,
            timeout,
            broadcast_period,
        ));
        agent.start().await?;
        agents.push(agent);
    }
    println!("📡 {} agents started, discovery running", agent_count);

    // Drive synthetic health drift so heartbeats carry changing signatures.
    let mut ticker = time::interval(Duration::from_millis(500));
    let started = time::Instant::now();
    let mut tick = 0u64;
    while started.elapsed() < Duration::from_secs(duration_s) {
        ticker.tick().await;
        tick += 1;
        for (i, agent) in agents.iter().enumerate() {
            let phase = (tick as f32 * 0.1) + i as f32;
            let mut signature = [0.0f32; SIGNATURE_LEN];
            for (j, v) in signature.iter_mut().enumerate() {
                *v = ((phase + j as f32 * 0.2).sin() * 0.5).clamp(-1.0, 1.0);
            }
            let risk = (0.05 + 0.02 * (phase.cos().abs())) as f32;
            match HealthSummary::new(signature, risk, 1.0, now_millis()) {
                Ok(health) => agent.update_local_health(health),
                Err(e) => error!(error = %e, "synthetic health rejected"),
            }
        }

        if tick % 10 == 0 {
            for agent in &agents {
                let stats = agent.swarm_stats();
                info!(
                    agent = %agent.config().agent_id(),
                    alive = stats.registry.alive_peers,
                    quorum = stats.registry.quorum_size,
                    congestion = ?stats.congestion,
                    "membership"
                );
            }
        }
    }

    // Exercise the safety gate before shutdown.
    println!();
    println!("{}", "Safety gate demonstration".bold());
    let lead = &agents[0];
    let demos: [(&str, Vec<(&str, f64)>); 3] = [
        ("safe_mode", vec![]),
        ("attitude_adjust", vec![("angle_degrees", 10.0)]),
        ("load_shed", vec![("shed_percent", 10.0)]),
    ];
    for (action, params) in demos {
        let params: HashMap<String, f64> =
            params.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        let allowed = lead.validate_action(action, &params, "sim-demo", "constellation");
        let verdict = if allowed {
            "ALLOWED".green()
        } else {
            "BLOCKED".red()
        };
        println!("   {:<18} -> {}", action, verdict);
    }

    println!();
    println!("{}", "Final constellation state".bold());
    for agent in &agents {
        let stats = agent.swarm_stats();
        println!(
            "   {} alive={} quorum={} heartbeats={} gossip_relays={} broadcasts={} skipped={}",
            agent.config().agent_id().to_string().cyan(),
            stats.registry.alive_peers,
            stats.registry.quorum_size,
            stats.registry.heartbeats_sent,
            stats.registry.gossip_relayed,
            stats.broadcast.broadcasts_sent,
            stats.broadcast.broadcasts_skipped,
        );
    }

    for agent in &agents {
        agent.stop().await;
    }
    println!("🚀 Constellation simulation stopped");

    Ok(())
}
