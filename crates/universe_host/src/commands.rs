//! Built-in chat commands of the host.
//!
//! Players reach these by sending chat text starting with `/`. Commands that
//! change the universe clock require an admin.

use anyhow::{bail, Context};
use std::sync::Arc;
use tracing::info;

use universe_server::context::{CommandInvoker, CommandProcessor};
use universe_server::UniverseClock;

const HELP: &str = "Commands: /help, /time, /whoami, /pause, /resume, /timescale <factor>";

/// Command processor backed by the shared universe clock.
pub struct HostCommands {
    clock: Arc<UniverseClock>,
}

impl HostCommands {
    pub fn new(clock: Arc<UniverseClock>) -> Self {
        Self { clock }
    }

    fn require_admin(invoker: &CommandInvoker, command: &str) -> anyhow::Result<()> {
        if !invoker.admin {
            bail!("/{command} requires admin privileges");
        }
        Ok(())
    }
}

impl CommandProcessor for HostCommands {
    fn process(&self, invoker: &CommandInvoker, command: &str, args: &str) -> anyhow::Result<Option<String>> {
        let reply = match command {
            "help" => HELP.to_string(),
            "time" => format!(
                "Universe time {:.1}s, timescale {}{}",
                self.clock.universe_time(),
                self.clock.timescale(),
                if self.clock.is_paused() { " (paused)" } else { "" }
            ),
            "whoami" => format!(
                "You are {} on connection {}{}",
                invoker.name,
                invoker.connection,
                if invoker.admin { " (admin)" } else { "" }
            ),
            "pause" | "resume" => {
                Self::require_admin(invoker, command)?;
                let paused = command == "pause";
                self.clock.set_paused(paused);
                info!("⏸️ {} {} the universe", invoker.name, if paused { "paused" } else { "resumed" });
                format!("Universe {}", if paused { "paused" } else { "resumed" })
            }
            "timescale" => {
                Self::require_admin(invoker, command)?;
                let factor: f64 = args
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid timescale '{}'", args.trim()))?;
                self.clock.set_timescale(factor);
                format!("Timescale set to {}", self.clock.timescale())
            }
            _ => return Ok(None),
        };
        Ok(Some(reply))
    }
}
