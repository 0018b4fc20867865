//! Minimal participant binary: echoes whatever it receives on `in` back out
//! on `out`, unchanged. The Rust counterpart of the original `repeat.cpp`
//! example, exercising the public engine API end to end.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use msgflo_common::Definition;
use msgflo_engine::{Engine, EngineConfig, Message, Participant};
use tokio::sync::OnceCell;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "msgflo-repeat")]
#[command(about = "Echoes inbound messages on its out port, unchanged")]
struct Args {
    /// Broker URL (amqp://... or mqtt://...). Falls back to MSGFLO_BROKER.
    #[arg(long, env = "MSGFLO_BROKER", default_value = "")]
    url: String,

    /// Participant role (instance name in the flow graph).
    #[arg(long, default_value = "repeat")]
    role: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    msgflo_common::logging::init_default_logging();

    let args = Args::parse();

    info!(role = %args.role, "starting repeat participant");

    let engine = Engine::new(EngineConfig {
        url: args.url,
        ..Default::default()
    })?;

    let mut definition = Definition::new(args.role, "CppRepeat");
    definition.label = "Repeats input on outport unchanged".to_string();
    definition.outports = vec![msgflo_common::Port::new("out", "any")];

    // `register_participant` needs the handler before it can hand back a
    // `Participant`, but the handler needs that same `Participant` to call
    // `send`. Break the cycle with a cell the handler reads lazily and the
    // caller fills in right after registration (spec §9's resolution of the
    // participant<->engine back-reference, adapted to a handler closure
    // created ahead of its own `Participant`).
    let participant_cell: Arc<OnceCell<Participant>> = Arc::new(OnceCell::new());
    let handler_cell = participant_cell.clone();

    let participant = engine
        .register_participant(
            definition,
            Arc::new(move |msg: Message| {
                let participant_cell = handler_cell.clone();
                Box::pin(async move {
                    info!("Repeat.process()");
                    let payload = msg.payload().to_vec();
                    if let Err(e) = msg.ack().await {
                        tracing::error!(error = %e, "failed to ack inbound message");
                        return;
                    }
                    if let Some(participant) = participant_cell.get() {
                        if let Err(e) = participant.send("out", payload).await {
                            tracing::error!(error = %e, "failed to echo payload");
                        }
                    }
                })
            }),
        )
        .await?;

    participant_cell
        .set(participant)
        .expect("participant cell set exactly once");

    println!(" [*] Waiting for messages. To exit press CTRL-C");

    tokio::select! {
        result = engine.launch() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}
