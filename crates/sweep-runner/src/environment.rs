use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::command::{CommandError, CommandLine};
use crate::key::TrialParameters;
use crate::poller::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySpec {
    pub params: TrialParameters,
    pub community: bool,
}

pub trait Environment {
    fn provision(&self, spec: &TopologySpec) -> Result<()>;

    /// Stop the topology and release its storage. Must be a no-op when
    /// nothing is running, including after a partial `provision`.
    fn teardown(&self);

    fn stop_containers(&self, names: &[String]) -> Result<(), CommandError>;
}

pub struct EnvironmentHandle<'a> {
    env: &'a dyn Environment,
    released: bool,
}

impl<'a> EnvironmentHandle<'a> {
    /// Provision `spec`. The handle exists before provisioning starts, so a
    /// provision that fails halfway is still torn down.
    pub fn provision(env: &'a dyn Environment, spec: &TopologySpec) -> Result<Self> {
        let handle = Self {
            env,
            released: false,
        };
        env.provision(spec)?;
        Ok(handle)
    }

    pub fn environment(&self) -> &'a dyn Environment {
        self.env
    }

    pub fn teardown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.env.teardown();
        }
    }
}

impl Drop for EnvironmentHandle<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct ComposeEnvironment {
    renderer: Option<CommandLine>,
    compose: CommandLine,
    docker: CommandLine,
    warmup: Duration,
    clock: Arc<dyn Clock>,
}

impl ComposeEnvironment {
    pub fn new(
        renderer: Option<CommandLine>,
        compose: CommandLine,
        docker: CommandLine,
        warmup: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            renderer,
            compose,
            docker,
            warmup,
            clock,
        }
    }

    fn render(&self, spec: &TopologySpec) -> Result<()> {
        let Some(renderer) = &self.renderer else {
            return Ok(());
        };
        let argv = render_argv(&renderer.with_args(Vec::<String>::new()), spec);
        crate::command::run_checked(&argv, renderer.work_dir())
            .context("rendering topology description")?;
        Ok(())
    }
}

impl Environment for ComposeEnvironment {
    fn provision(&self, spec: &TopologySpec) -> Result<()> {
        tracing::info!(
            nodes = spec.params.node_count,
            community = spec.community,
            "provisioning topology"
        );
        self.render(spec)?;
        self.compose
            .run(["up", "-d"])
            .context("starting topology")?;
        self.clock.sleep(self.warmup);
        Ok(())
    }

    fn teardown(&self) {
        let steps: [(&CommandLine, &[&str]); 3] = [
            (&self.compose, &["down"]),
            (&self.docker, &["volume", "prune", "-f"]),
            (&self.compose, &["rm", "-f"]),
        ];
        for (line, args) in steps {
            if let Err(err) = line.run(args.iter().copied()) {
                tracing::warn!(error = %err, "teardown step failed, continuing");
            }
        }
        tracing::info!("topology torn down");
    }

    fn stop_containers(&self, names: &[String]) -> Result<(), CommandError> {
        if names.is_empty() {
            return Ok(());
        }
        let mut args = vec!["kill".to_string()];
        args.extend(names.iter().cloned());
        self.docker.run(args)?;
        Ok(())
    }
}

pub fn render_argv(argv: &[String], spec: &TopologySpec) -> Vec<String> {
    let p = &spec.params;
    let substitutions = [
        ("{nodes}", p.node_count.to_string()),
        ("{faults}", p.fault_count.to_string()),
        ("{depth}", p.repair_depth.to_string()),
        ("{repair_peers}", p.repair_peers.to_string()),
        ("{replication}", p.replication_factor.to_string()),
        ("{payload}", p.payload_size.clone()),
        ("{community}", spec.community.to_string()),
    ];
    argv.iter()
        .map(|arg| {
            substitutions
                .iter()
                .fold(arg.clone(), |acc, (token, value)| acc.replace(token, value))
        })
        .collect()
}
