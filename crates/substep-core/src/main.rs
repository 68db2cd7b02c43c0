use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{value_parser, Arg, Command};
use futures::future::join_all;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use substep_core::prelude::*;
use substep_core::{init_tracing, CollaboratorError, InputVersion};

const DOCUMENT: &str = "doc-1";
const ORIGINAL: &str = "The report was written by the team and it was reviewed by the board.";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Command::new("substep")
        .version(substep_core::VERSION)
        .about("Substep state cache and document-version resolution engine")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Path to a TOML configuration file"),
        )
        .subcommand(
            Command::new("scenario")
                .about("Walk a two-step session through the in-memory store"),
        )
        .subcommand(
            Command::new("stress")
                .about("Fire concurrent partial saves and check for lost updates")
                .arg(
                    Arg::new("steps")
                        .long("steps")
                        .default_value("8")
                        .value_parser(value_parser!(usize))
                        .help("Number of step names"),
                )
                .arg(
                    Arg::new("writes")
                        .long("writes")
                        .default_value("50")
                        .value_parser(value_parser!(usize))
                        .help("Saves issued per step"),
                )
                .arg(
                    Arg::new("latency-ms")
                        .long("latency-ms")
                        .default_value("1")
                        .value_parser(value_parser!(u64))
                        .help("Simulated remote latency per call"),
                ),
        );

    let matches = cli.get_matches();

    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    init_tracing(&config)?;

    match matches.subcommand() {
        Some(("scenario", _)) => run_scenario(&config).await,
        Some(("stress", args)) => {
            let steps = args.get_one::<usize>("steps").copied().unwrap_or(8);
            let writes = args.get_one::<usize>("writes").copied().unwrap_or(50);
            let latency = args.get_one::<u64>("latency-ms").copied().unwrap_or(1);
            run_stress(steps, writes, Duration::from_millis(latency)).await
        }
        _ => {
            println!("substep {}: run `substep --help` for commands", substep_core::VERSION);
            Ok(())
        }
    }
}

/// Flags passive constructions by counting "was" followed by "by"
struct PassiveVoice;

#[async_trait]
impl Analyzer for PassiveVoice {
    async fn analyze(&self, text: &str, _: Option<&Value>) -> Result<Value, CollaboratorError> {
        let issues: Vec<Value> = text
            .split(" and ")
            .enumerate()
            .filter(|(_, clause)| clause.contains("was") && clause.contains(" by "))
            .map(|(index, clause)| json!({ "type": "passive", "clause": index, "text": clause.trim() }))
            .collect();
        Ok(json!({ "score": 10usize.saturating_sub(issues.len()), "issues": issues }))
    }
}

struct Observations {
    failed: usize,
}

impl Observations {
    fn check(&mut self, label: &str, ok: bool) {
        println!("  [{}] {label}", if ok { "ok" } else { "FAIL" });
        if !ok {
            self.failed += 1;
        }
    }
}

async fn run_scenario(config: &EngineConfig) -> Result<()> {
    let client = Arc::new(InMemoryStateClient::new());
    let documents = StaticDocumentSource::new().with_document(DOCUMENT, ORIGINAL);
    let controller = SessionCacheController::new(client.clone());
    let mut seen = Observations { failed: 0 };

    println!("Session s1");
    controller.init_session("s1").await?;
    seen.check("fresh session has no records", controller.record_count() == 0);

    let first = StepContext::new(controller.clone(), "step1-0", DOCUMENT)
        .with_suggestion_cache(SuggestionCache::from_config(config));
    let second = StepContext::new(controller.clone(), "step1-1", DOCUMENT)
        .with_predecessors(["step1-0"]);

    println!("Step step1-0");
    let outcome = first.analysis(&documents, &PassiveVoice).await?;
    seen.check("first analysis runs the analyzer", outcome.is_fresh());
    seen.check("hasState(step1-0) after analysis", controller.has_state("step1-0"));

    let again = first.analysis(&documents, &PassiveVoice).await?;
    seen.check("second analysis is served from cache", !again.is_fresh());

    println!("Step step1-1");
    let input = second.input_text(&documents).await?;
    seen.check("input resolves to the original", input == ORIGINAL);
    seen.check(
        "resolved version is the original",
        second.input_version() == InputVersion::Original,
    );

    println!("Step step1-0 accepts an edit");
    first.select_issues(json!({ "sel": [0] })).await?;
    first.accept("EDITED").await?;
    let record = first
        .record()
        .context("step1-0 record missing after accept")?;
    seen.check("edit keeps user inputs", record.user_inputs == Some(json!({ "sel": [0] })));
    seen.check("edit completes the step", record.status == StepStatus::Completed);

    let input = second.input_text(&documents).await?;
    seen.check("step1-1 now resolves to EDITED", input == "EDITED");

    println!("Re-entering s1");
    controller.init_session("s1").await?;
    seen.check("re-entry keeps cached records", controller.record_count() == 1);

    controller.clear_state("step1-0").await?;
    seen.check("clear drops the record", controller.get_state("step1-0").is_none());
    seen.check("clear drops it remotely", client.stored("s1", "step1-0").is_none());

    if seen.failed > 0 {
        bail!("{} observation(s) failed", seen.failed);
    }
    println!("All observations hold");
    Ok(())
}

async fn run_stress(steps: usize, writes: usize, latency: Duration) -> Result<()> {
    let client = Arc::new(InMemoryStateClient::new().with_latency(latency));
    let controller = SessionCacheController::new(client.clone());
    controller.init_session("stress").await?;

    let started = Instant::now();
    let tickets: Vec<_> = (0..steps)
        .flat_map(|step| {
            let controller = controller.clone();
            (0..writes).map(move |i| {
                let name = format!("step-{step}");
                // Alternate fields so every write depends on the previous merge
                if i % 2 == 0 {
                    controller.save_user_inputs(&name, json!({ "seq": i }))
                } else {
                    controller.save_modified_text(&name, format!("v{i}"))
                }
            })
        })
        .collect();
    let results = join_all(tickets).await;
    let elapsed = started.elapsed();

    let failed_writes = results.iter().filter(|r| r.is_err()).count();
    let last_even = (0..writes).rev().find(|i| i % 2 == 0);
    let last_odd = (0..writes).rev().find(|i| i % 2 == 1);

    let mut lost = Vec::new();
    for step in 0..steps {
        let name = format!("step-{step}");
        let local = controller.get_state(&name);
        let remote = client.stored("stress", &name);
        let expected_inputs = last_even.map(|i| json!({ "seq": i }));
        let expected_text = last_odd.map(|i| format!("v{i}"));

        // With no writes issued, no record is the correct outcome
        let holds = |record: &Option<StepRecord>| match record {
            Some(r) => r.user_inputs == expected_inputs && r.modified_text == expected_text,
            None => writes == 0,
        };
        if !holds(&local) || !holds(&remote) {
            lost.push(name);
        }
    }

    let report = json!({
        "steps": steps,
        "writes_per_step": writes,
        "latency_ms": u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        "elapsed_ms": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        "failed_writes": failed_writes,
        "lost_updates": lost,
        "success": failed_writes == 0 && lost.is_empty(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if failed_writes > 0 || !lost.is_empty() {
        bail!(
            "stress run failed: {failed_writes} failed write(s), {} lost update(s)",
            lost.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stress_without_writes_succeeds() {
        assert!(run_stress(3, 0, Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn stress_keeps_every_field() {
        assert!(run_stress(2, 5, Duration::ZERO).await.is_ok());
    }
}
