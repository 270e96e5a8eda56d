//! Telescope - a hosted mount that publishes slew events.
//!
//! This example demonstrates:
//! - Describing a class with options and an interface
//! - A locked method that publishes an event when it finishes
//! - A main loop started with the object
//! - Subscribing a local callback to the event
//!
//! # Running
//!
//! ```text
//! cargo run --example telescope              # defaults, port 7666
//! cargo run --example telescope skywire.toml # settings from a file
//! RUST_LOG=skywire=debug cargo run --example telescope
//! ```
//!
//! While it runs, any other process on the bus can call
//! `127.0.0.1:7666/Telescope/main` or `127.0.0.1:7666/Mount/0`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use skywire::classloader::ClassDescriptor;
use skywire::logging::init_logging;
use skywire::object::{Hosted, MethodError, MethodTable, ObjectContext};
use skywire::protocol::Kwargs;
use skywire::{args, BrokerConfig, Manager, Value};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Position {
    ra: f64,
    dec: f64,
}

#[derive(Default)]
struct Telescope {
    position: Mutex<Position>,
}

impl Telescope {
    async fn slew(self: Arc<Self>, target: Position, ctx: ObjectContext) -> Result<Position, MethodError> {
        let rate: f64 = ctx.config().get_as("slew_rate")?;
        if rate <= 0.0 {
            return Err(MethodError::new("ValueError", "slew_rate must be positive"));
        }

        let from = *self.position.lock();
        let distance = (target.ra - from.ra).abs().max((target.dec - from.dec).abs());
        tokio::time::sleep(Duration::from_secs_f64(distance / rate)).await;
        *self.position.lock() = target;

        ctx.publish("slewComplete", args![target.ra, target.dec], Kwargs::new())
            .await;
        Ok(target)
    }

    /// Sidereal drift, once a second.
    async fn track(self: Arc<Self>, _ctx: ObjectContext) -> Result<(), MethodError> {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            let mut position = self.position.lock();
            position.ra = (position.ra + 15.0 / 3600.0) % 360.0;
        }
    }
}

fn telescope_class() -> ClassDescriptor {
    ClassDescriptor::new("Telescope", |_ctx| {
        Ok(Hosted::new(
            Telescope::default(),
            MethodTable::new()
                .locked("slew", |t: Arc<Telescope>, (target,): (Position,), ctx| t.slew(target, ctx))
                .method("position", |t: Arc<Telescope>, (): (), _ctx| async move {
                    Ok(*t.position.lock())
                })
                .on_start(|_t, ctx: ObjectContext| async move {
                    tracing::info!("{} ready", ctx.location());
                    Ok(())
                })
                .main(Telescope::track),
        ))
    })
    .implements("Mount")
    .option("slew_rate", 5.0)
    .option("site", "La Palma")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(1);

    let config = match std::env::args().nth(1) {
        Some(path) => BrokerConfig::from_file(path)?,
        None => BrokerConfig::default(),
    };

    let manager = Manager::start(config).await?;
    let scope = manager
        .add_class(&telescope_class(), Some("main"), BTreeMap::new(), true)
        .await?;

    manager
        .subscribe_callback(&scope.method("slewComplete"), |args, _kwargs| {
            tracing::info!("Slew complete at {:?}", args);
        })
        .await?;

    scope.set("slew_rate", Value::Float(20.0)).await?;
    let target = Value::from_serialize(&Position { ra: 83.6, dec: 22.0 })?;
    let reached = scope.call("slew", vec![target]).await?;
    tracing::info!("Reached {:?}", reached);

    tracing::info!("Serving {} until Ctrl-C", manager.bus());
    manager.run_until_signal().await;
    Ok(())
}
