//! Packet filter backed by the `iptables` command.

use std::sync::Arc;

use async_trait::async_trait;

use super::PacketFilter;
use crate::error::{Error, Result};
use crate::exec::{display_command, CommandOutput, CommandRunner};

/// `iptables -C` exits with this status when the rule is not present.
const RULE_NOT_FOUND: i32 = 1;

pub struct Iptables {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl Iptables {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: "iptables".to_string(),
        }
    }

    /// `iptables --wait -t <table> <op> <chain> [position] <args...>`
    fn command(
        table: &str,
        op: &str,
        chain: &str,
        position: Option<u32>,
        args: &[String],
    ) -> Vec<String> {
        let mut cmd = vec![
            "--wait".to_string(),
            "-t".to_string(),
            table.to_string(),
            op.to_string(),
            chain.to_string(),
        ];
        if let Some(pos) = position {
            cmd.push(pos.to_string());
        }
        cmd.extend(args.iter().cloned());
        cmd
    }

    async fn run(&self, args: &[String]) -> Result<CommandOutput> {
        self.runner
            .run(&self.binary, args)
            .await
            .map_err(|e| Error::Firewall(format!("{}: {}", display_command(&self.binary, args), e)))
    }

    fn failure(&self, args: &[String], output: &CommandOutput) -> Error {
        let code = output
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Error::Firewall(format!(
            "{} exited with {}: {}",
            display_command(&self.binary, args),
            code,
            output.stderr.trim()
        ))
    }

    async fn change(&self, args: Vec<String>) -> Result<()> {
        let output = self.run(&args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(self.failure(&args, &output))
        }
    }
}

#[async_trait]
impl PacketFilter for Iptables {
    async fn rule_exists(&self, table: &str, chain: &str, args: &[String]) -> Result<bool> {
        let cmd = Self::command(table, "-C", chain, None, args);
        let output = self.run(&cmd).await?;
        match output.code {
            Some(0) => Ok(true),
            Some(RULE_NOT_FOUND) => Ok(false),
            _ => Err(self.failure(&cmd, &output)),
        }
    }

    async fn insert_rule(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        args: &[String],
    ) -> Result<()> {
        self.change(Self::command(table, "-I", chain, Some(position), args))
            .await
    }

    async fn append_rule_if_absent(
        &self,
        table: &str,
        chain: &str,
        args: &[String],
    ) -> Result<bool> {
        if self.rule_exists(table, chain, args).await? {
            return Ok(false);
        }
        self.change(Self::command(table, "-A", chain, None, args))
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockCommandRunner;

    fn rule() -> Vec<String> {
        ["-i", "kube-bridge", "-j", "ACCEPT"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn op_is(args: &[String], op: &str) -> bool {
        args.get(3).map(String::as_str) == Some(op)
    }

    #[tokio::test]
    async fn check_maps_exit_codes() {
        let mut runner = MockCommandRunner::new();
        let mut calls = 0;
        runner
            .expect_run()
            .withf(|program, args| {
                program == "iptables"
                    && args
                        == [
                            "--wait", "-t", "filter", "-C", "FORWARD", "-i", "kube-bridge", "-j",
                            "ACCEPT",
                        ]
            })
            .times(3)
            .returning(move |_, _| {
                calls += 1;
                Ok(match calls {
                    1 => CommandOutput::ok(""),
                    2 => CommandOutput::failed(1, "iptables: Bad rule"),
                    _ => CommandOutput::failed(4, "Resource temporarily unavailable"),
                })
            });

        let ipt = Iptables::new(Arc::new(runner));
        assert!(ipt.rule_exists("filter", "FORWARD", &rule()).await.unwrap());
        assert!(!ipt.rule_exists("filter", "FORWARD", &rule()).await.unwrap());
        let err = ipt.rule_exists("filter", "FORWARD", &rule()).await.unwrap_err();
        assert!(matches!(err, Error::Firewall(ref m) if m.contains("exited with 4")));
    }

    #[tokio::test]
    async fn insert_places_position_before_args() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|_, args| {
                args == [
                    "--wait", "-t", "filter", "-I", "FORWARD", "1", "-i", "kube-bridge", "-j",
                    "ACCEPT",
                ]
            })
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));

        let ipt = Iptables::new(Arc::new(runner));
        ipt.insert_rule("filter", "FORWARD", 1, &rule()).await.unwrap();
    }

    #[tokio::test]
    async fn append_skips_existing_rule() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|_, args| op_is(args, "-C"))
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        runner
            .expect_run()
            .withf(|_, args| op_is(args, "-A"))
            .times(0);

        let ipt = Iptables::new(Arc::new(runner));
        assert!(!ipt
            .append_rule_if_absent("nat", "POSTROUTING", &rule())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn append_adds_missing_rule() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|_, args| op_is(args, "-C"))
            .times(1)
            .returning(|_, _| Ok(CommandOutput::failed(1, "")));
        runner
            .expect_run()
            .withf(|_, args| op_is(args, "-A") && args[2] == "nat" && args[4] == "POSTROUTING")
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));

        let ipt = Iptables::new(Arc::new(runner));
        assert!(ipt
            .append_rule_if_absent("nat", "POSTROUTING", &rule())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn spawn_failure_is_a_firewall_error() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _| {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No such file or directory",
            ))
        });

        let ipt = Iptables::new(Arc::new(runner));
        let err = ipt
            .insert_rule("filter", "FORWARD", 1, &rule())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Firewall(_)));
    }
}
