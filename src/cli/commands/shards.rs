//! Retry shard count calculator.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::services::test_run::{retry_shard_count, REPEAT_COUNT_FOR_FAILING_TESTS};

#[derive(Args, Debug)]
pub struct ShardsArgs {
    /// Shards of the original run
    #[arg(long)]
    pub original: u32,
    /// Tests to retry
    #[arg(long)]
    pub retried: usize,
    /// Tests that ran in the original run
    #[arg(long)]
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ShardsOutput {
    pub original_shards: u32,
    pub tests_to_retry: usize,
    pub total_tests_ran: usize,
    pub repeat_count: u32,
    pub retry_shards: u32,
}

impl CommandOutput for ShardsOutput {
    fn to_human(&self) -> String {
        format!(
            "{} shard(s) to retry {} of {} test(s) {} time(s) each (originally {} shard(s))",
            self.retry_shards, self.tests_to_retry, self.total_tests_ran, self.repeat_count, self.original_shards
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub fn execute(args: &ShardsArgs, json_mode: bool) -> Result<()> {
    if args.original == 0 {
        anyhow::bail!("--original must be at least 1");
    }
    let result = ShardsOutput {
        original_shards: args.original,
        tests_to_retry: args.retried,
        total_tests_ran: args.total,
        repeat_count: REPEAT_COUNT_FOR_FAILING_TESTS,
        retry_shards: retry_shard_count(args.original, args.retried, args.total),
    };
    output(&result, json_mode);
    Ok(())
}
