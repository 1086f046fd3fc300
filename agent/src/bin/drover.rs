// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The drover operator CLI.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use drover_agent::environments::Environments;
use slog::Drain;

#[tokio::main]
async fn main() -> Result<()> {
    // Every provider linked into this binary registers itself here.
    drover_provider::dummy::register();
    let app = DroverApp::parse();
    app.exec().await
}

fn cli_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Deploy, scale, and relate services across a pool of machines.
#[derive(Debug, Parser)]
#[clap(version)]
struct DroverApp {
    /// Environment to operate on (defaults to the environments file's
    /// default entry).
    #[clap(short = 'e', long = "environment", global = true)]
    environment: Option<String>,

    #[clap(subcommand)]
    command: DroverCmd,
}

impl DroverApp {
    async fn exec(&self) -> Result<()> {
        let environments = Environments::read(&Environments::default_path())
            .context("reading environments file")?;
        match &self.command {
            DroverCmd::AddMachine(args) => {
                args.exec(&environments, self.environment.as_deref()).await
            }
            DroverCmd::AddUnit(args) => {
                args.exec(&environments, self.environment.as_deref()).await
            }
            DroverCmd::DestroyEnvironment(args) => {
                args.exec(&environments, self.environment.as_deref()).await
            }
        }
    }
}

#[derive(Debug, Subcommand)]
enum DroverCmd {
    /// Add a machine to the environment
    AddMachine(AddMachineArgs),
    /// Add a service unit
    AddUnit(AddUnitArgs),
    /// Terminate all machines and resources in the environment
    DestroyEnvironment(DestroyEnvironmentArgs),
}

#[derive(Debug, Args)]
struct AddMachineArgs {}

impl AddMachineArgs {
    async fn exec(
        &self,
        environments: &Environments,
        env_name: Option<&str>,
    ) -> Result<()> {
        let log = cli_logger();
        let environ = environments.open(env_name)?;
        let state = environ.open_state(&log).await?;
        let machine = state.add_machine()?;
        println!("added machine {}", machine);
        Ok(())
    }
}

#[derive(Debug, Args)]
struct AddUnitArgs {
    /// The service to add a unit of
    service: Option<String>,

    /// Number of service units to add
    #[clap(short = 'n', long = "num-units", default_value_t = 1)]
    num_units: i32,
}

impl AddUnitArgs {
    fn validate(&self) -> Result<&str> {
        let Some(service) = self.service.as_deref() else {
            bail!("no service specified");
        };
        if self.num_units < 1 {
            bail!("must add at least one unit");
        }
        Ok(service)
    }

    async fn exec(
        &self,
        environments: &Environments,
        env_name: Option<&str>,
    ) -> Result<()> {
        let service = self.validate()?;
        let log = cli_logger();
        let environ = environments.open(env_name)?;
        let state = environ.open_state(&log).await?;
        for _ in 0..self.num_units {
            let unit = state.add_unit(service)?;
            println!("added unit {}", unit);
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
struct DestroyEnvironmentArgs {}

impl DestroyEnvironmentArgs {
    async fn exec(
        &self,
        environments: &Environments,
        env_name: Option<&str>,
    ) -> Result<()> {
        let environ = environments.open(env_name)?;
        environ.destroy().await?;
        println!("destroyed environment {}", environ.name());
        Ok(())
    }
}
