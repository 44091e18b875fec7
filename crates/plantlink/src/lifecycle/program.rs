use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The long-running programs of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Program {
    Collector,
    EssPoller,
    EnvPoller,
    Sender,
    ControlFetcher,
    ControlExecutor,
    ControlTestGenerator,
}

impl Program {
    pub const ALL: [Program; 7] = [
        Program::Collector,
        Program::EssPoller,
        Program::EnvPoller,
        Program::Sender,
        Program::ControlFetcher,
        Program::ControlExecutor,
        Program::ControlTestGenerator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Program::Collector => "collector",
            Program::EssPoller => "ess-poller",
            Program::EnvPoller => "env-poller",
            Program::Sender => "sender",
            Program::ControlFetcher => "control-fetcher",
            Program::ControlExecutor => "control-executor",
            Program::ControlTestGenerator => "control-test-generator",
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Program {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Program::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown program: {s}"))
    }
}
