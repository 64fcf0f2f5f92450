use std::process::Command;

use anyhow::{anyhow, Result};
use edgeup_core::{ServiceConfig, ServiceKind};
use tracing::info;

use crate::unpack::run_command;

/// Start/stop/restart of the managed service. Implementations should treat
/// starting a running service or stopping a stopped one as success.
pub trait ServiceController: Send + Sync {
    fn describe(&self) -> String;

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn restart(&self) -> Result<()> {
        self.stop()?;
        self.start()
    }
}

impl<T: ServiceController + ?Sized> ServiceController for Box<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn start(&self) -> Result<()> {
        (**self).start()
    }

    fn stop(&self) -> Result<()> {
        (**self).stop()
    }

    fn restart(&self) -> Result<()> {
        (**self).restart()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemdServiceController {
    unit: String,
}

impl SystemdServiceController {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    fn systemctl(&self, verb: &str) -> Result<()> {
        info!(unit = %self.unit, action = verb, "systemctl");
        run_command(
            Command::new("systemctl").arg(verb).arg(&self.unit),
            &format!("systemctl {verb} {} failed", self.unit),
        )
    }
}

impl ServiceController for SystemdServiceController {
    fn describe(&self) -> String {
        format!("systemd unit {}", self.unit)
    }

    fn start(&self) -> Result<()> {
        self.systemctl("start")
    }

    fn stop(&self) -> Result<()> {
        self.systemctl("stop")
    }

    fn restart(&self) -> Result<()> {
        self.systemctl("restart")
    }
}

/// Runs operator-supplied argv commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandServiceController {
    start: Vec<String>,
    stop: Vec<String>,
    restart: Vec<String>,
}

impl CommandServiceController {
    pub fn new(start: Vec<String>, stop: Vec<String>, restart: Vec<String>) -> Result<Self> {
        if start.is_empty() || stop.is_empty() {
            return Err(anyhow!("service start and stop commands must not be empty"));
        }
        Ok(Self {
            start,
            stop,
            restart,
        })
    }

    fn run(&self, action: &str, argv: &[String]) -> Result<()> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("service {action} command is empty"))?;
        info!(action, command = %argv.join(" "), "running service command");
        run_command(
            Command::new(program).args(args),
            &format!("service {action} command failed"),
        )
    }
}

impl ServiceController for CommandServiceController {
    fn describe(&self) -> String {
        format!("command '{}'", self.start.join(" "))
    }

    fn start(&self) -> Result<()> {
        self.run("start", &self.start)
    }

    fn stop(&self) -> Result<()> {
        self.run("stop", &self.stop)
    }

    fn restart(&self) -> Result<()> {
        if self.restart.is_empty() {
            self.stop()?;
            return self.start();
        }
        self.run("restart", &self.restart)
    }
}

/// For installations whose service is supervised elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopServiceController;

impl ServiceController for NoopServiceController {
    fn describe(&self) -> String {
        "unmanaged service".to_string()
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

pub fn service_controller_from_config(config: &ServiceConfig) -> Result<Box<dyn ServiceController>> {
    match config.kind {
        ServiceKind::Systemd => {
            let unit = config
                .unit
                .as_deref()
                .ok_or_else(|| anyhow!("service.unit is required for systemd services"))?;
            Ok(Box::new(SystemdServiceController::new(unit)))
        }
        ServiceKind::Command => Ok(Box::new(CommandServiceController::new(
            config.start.clone(),
            config.stop.clone(),
            config.restart.clone(),
        )?)),
        ServiceKind::None => Ok(Box::new(NoopServiceController)),
    }
}
