//! Kart Rewind Demo
//!
//! Runs one server and two predicting clients over an in-process loopback
//! transport with artificial latency, then checks that every client landed
//! on the server's timeline.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kart_rewind::{
    core::hash::short_hex,
    game::{KartControls, Tick},
    network::{LoopbackHub, LoopbackTransport, RaceSession},
    NetworkMode, RaceConfig, RaceWorld, StateHash, VERSION,
};

const NUM_CLIENTS: u8 = 2;
const LATENCY_TICKS: u32 = 6;
const FRAMES: u32 = 1800;
/// Frames run with inputs held so every client catches the last state sync.
const SETTLE_FRAMES: u32 = 240;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;

    let mut config = RaceConfig::from_env().context("invalid race configuration")?;
    if !config.network_mode.is_networking() {
        config.network_mode = NetworkMode::Lan;
    }

    info!("Kart Rewind v{}", VERSION);
    info!("Tick Rate: {} Hz", config.ticks_per_second);
    info!(
        "State frequency: {} ticks, rollback window: {} ticks",
        config.state_frequency, config.max_rollback_ticks
    );

    demo_race(&config)?;
    verify_determinism(&config)
}

/// Scripted stick input for a kart at a given frame.
fn scripted_controls(kart: u8, frame: u32) -> KartControls {
    let mut c = KartControls::new();
    let phase = (frame / 45 + kart as u32 * 3) % 8;
    c.set_accel(if phase == 7 { 0.3 } else { 1.0 });
    c.set_steer(match phase {
        1 | 2 => 0.4,
        5 => -0.6,
        _ => 0.0,
    });
    c.set_nitro(phase == 3 && kart == 0);
    c
}

fn demo_race(config: &RaceConfig) -> anyhow::Result<()> {
    info!("=== Starting Demo Race ===");
    let hub = LoopbackHub::new(LATENCY_TICKS);
    hub.set_drop_every(7);
    hub.set_reorder_every(5, 15);

    let (transport, queue) = hub.join_server();
    let mut server: RaceSession<LoopbackTransport> =
        RaceSession::server(config.clone(), NUM_CLIENTS, transport, queue);
    let mut clients: Vec<RaceSession<LoopbackTransport>> = (0..NUM_CLIENTS)
        .map(|_| {
            let (t, q) = hub.join_client();
            RaceSession::client(config.clone(), NUM_CLIENTS, t, q)
        })
        .collect();

    let mut server_digests: BTreeMap<Tick, StateHash> = BTreeMap::new();
    let mut last_report = 0;

    for frame in 0..FRAMES + SETTLE_FRAMES {
        hub.advance();
        server.update(1);
        server_digests.insert(server.world().tick(), server.world().digest());

        for client in &mut clients {
            if let Some(kart) = client.local_kart() {
                if frame < FRAMES && client.world().clock().karts_can_move() {
                    client.set_local_controls(scripted_controls(kart, frame));
                }
            }
            client.update(1);
        }

        if frame - last_report >= 300 {
            info!(
                "Frame {}: server tick {} phase {:?}, {} in flight",
                frame,
                server.world().tick(),
                server.world().phase(),
                hub.in_flight()
            );
            last_report = frame;
        }
        if server.is_race_over() {
            info!("Race over at server tick {}", server.world().tick());
            break;
        }
    }

    info!("=== Race Results ===");
    for kart in server.world().karts() {
        let pos = kart.transform().origin;
        info!(
            "Kart {}: z = {:.2}, finished = {}, eliminated = {}",
            kart.id(),
            pos.z,
            kart.is_finished(),
            kart.is_eliminated()
        );
    }
    info!(
        "Server: {} states sent, {} inputs relayed, {} game events, {} packets dropped by the hub",
        server.stats().states_sent,
        server.stats().inputs_sent,
        server.game_events().accepted(),
        hub.dropped()
    );

    let mut diverged = 0;
    for (i, client) in clients.iter().enumerate() {
        let stats = client.rewind_stats();
        let tick = client.world().tick();
        let digest = client.world().digest();
        info!(
            "Client {}: {} rewinds, {} ticks replayed, {} stale, {} game events ({} dropped), rtt {:?}",
            i,
            stats.rewinds,
            stats.replayed_ticks,
            stats.stale_snapshots,
            client.game_events().accepted(),
            client.game_events().dropped(),
            client.server_rtt()
        );
        match server_digests.get(&tick) {
            Some(expected) if *expected == digest => {
                info!("Client {} matches server at tick {}: {}", i, tick, short_hex(&digest));
            }
            Some(expected) => {
                warn!(
                    "Client {} diverged at tick {}: {} vs server {}",
                    i,
                    tick,
                    short_hex(&digest),
                    short_hex(expected)
                );
                diverged += 1;
            }
            None => warn!("Client {} at tick {} has no server digest to compare", i, tick),
        }
    }
    if diverged > 0 {
        bail!("{diverged} client(s) diverged from the server");
    }
    Ok(())
}

fn verify_determinism(config: &RaceConfig) -> anyhow::Result<()> {
    info!("=== Verifying Determinism ===");
    let mut offline = config.clone();
    offline.network_mode = NetworkMode::Offline;
    offline.race_now = true;

    let run = || {
        let mut world = RaceWorld::new(&offline, NUM_CLIENTS);
        for frame in 0..600 {
            for kart in 0..NUM_CLIENTS {
                world.set_controls(kart, scripted_controls(kart, frame));
            }
            world.step();
        }
        world.digest()
    };

    let first = run();
    let second = run();
    info!("Run A: {}", hex::encode(first));
    info!("Run B: {}", hex::encode(second));
    if first != second {
        bail!("DETERMINISM FAILURE: hashes differ");
    }
    info!("DETERMINISM VERIFIED: Hashes match!");
    Ok(())
}
