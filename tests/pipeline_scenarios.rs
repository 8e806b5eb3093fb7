//! End-to-end pipeline runs against real local shell commands

mod common;

use common::{flaky_command, EventLog};
use convoy::{
    virtual_fn, CancelToken, Disposition, PipelineDescriptor, RunPolicy, Step,
};
use std::time::Duration;

#[tokio::test]
async fn test_sequential_run_emits_ordered_events() {
    let pipeline = PipelineDescriptor::new("Deploy")
        .step(Step::local("prepare", "true"))
        .step(Step::local("ship", "true"))
        .build();
    let log = EventLog::attach(&pipeline);

    let summary = pipeline.run().await;

    assert!(summary.success);
    assert_eq!(summary.steps_run, 2);
    assert_eq!(
        log.lifecycle_names(),
        [
            "init",
            "step_init:1",
            "step_finish",
            "step_init:2",
            "step_finish",
            "finish"
        ]
    );
}

#[tokio::test]
async fn test_failure_halts_later_steps() {
    let dir = tempfile::tempdir().expect("tempdir");
    let witness = dir.path().join("ran");

    let pipeline = PipelineDescriptor::new("Deploy")
        .step(Step::local("breaks", "exit 9"))
        .step(Step::local(
            "never runs",
            format!("touch {}", witness.display()),
        ))
        .build();
    let log = EventLog::attach(&pipeline);

    let summary = pipeline.run().await;

    assert!(!summary.success);
    assert_eq!(summary.steps_run, 1);
    assert_eq!(
        summary.failure.and_then(|f| f.exit_code()),
        Some(9)
    );
    assert!(!witness.exists(), "the step after the failure must not run");
    assert_eq!(
        log.lifecycle_names(),
        ["init", "step_init:1", "step_fail", "fail", "finish"]
    );
}

#[tokio::test]
async fn test_headers_reset_step_numbering() {
    let pipeline = PipelineDescriptor::new("Deploy")
        .header("Build")
        .step(Step::local("compile", "true"))
        .step(Step::local("package", "true"))
        .header("Ship")
        .step(Step::local("upload", "true"))
        .build();
    let log = EventLog::attach(&pipeline);

    pipeline.run().await;

    let inits: Vec<String> = log
        .lifecycle_names()
        .into_iter()
        .filter(|n| n.starts_with("step_init"))
        .collect();
    assert_eq!(inits, ["step_init:1", "step_init:2", "step_init:1"]);
}

#[tokio::test]
async fn test_retry_until_success_within_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut step = Step::local("flaky", flaky_command(dir.path(), 2));
    step.policy.max_retries = 4;

    let pipeline = PipelineDescriptor::new("Deploy").step(step).build();
    let log = EventLog::attach(&pipeline);

    let summary = pipeline.run().await;

    assert!(summary.success);
    // two failures, so two retries before the third attempt passes
    assert_eq!(log.retries(), 2);
    assert_eq!(log.count("step_finish"), 1);
    assert_eq!(log.count("step_fail"), 0);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut step = Step::local("flaky", flaky_command(dir.path(), 10));
    step.policy.max_retries = 2;

    let pipeline = PipelineDescriptor::new("Deploy").step(step).build();
    let log = EventLog::attach(&pipeline);

    let summary = pipeline.run().await;

    assert!(!summary.success);
    assert_eq!(log.retries(), 2);
    assert_eq!(log.count("step_fail"), 1);
    assert_eq!(log.count("step_finish"), 0);
}

#[tokio::test]
async fn test_on_success_terminate_halts_the_run() {
    let pipeline = PipelineDescriptor::new("Guarded")
        .step(
            Step::local("must not succeed", "true").with_policy(RunPolicy {
                on_success: Disposition::Terminate,
                ..Default::default()
            }),
        )
        .step(Step::local("unreached", "true"))
        .build();

    let summary = pipeline.run().await;

    assert!(!summary.success);
    assert_eq!(summary.steps_run, 1);
    let failure = summary.failure.expect("halt carries the success result");
    assert!(failure.ok, "the halting result is the success itself");
}

#[tokio::test]
async fn test_on_failure_continue_absorbs_the_error() {
    let pipeline = PipelineDescriptor::new("Deploy")
        .step(
            Step::local("optional", "exit 1").with_policy(RunPolicy {
                on_failure: Disposition::Continue,
                ..Default::default()
            }),
        )
        .step(Step::local("still runs", "true"))
        .build();
    let log = EventLog::attach(&pipeline);

    let summary = pipeline.run().await;

    assert!(summary.success);
    assert_eq!(summary.steps_run, 2);
    assert_eq!(log.count("fail"), 0);
}

#[tokio::test]
async fn test_working_directory_prefixes_the_command() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(dir.path().join("sub")).expect("mkdir");

    let pipeline = PipelineDescriptor::new("Deploy")
        .step(
            Step::local("write here", "touch marker").with_working_directory(
                dir.path().join("sub").display().to_string(),
            ),
        )
        .build();

    let summary = pipeline.run().await;

    assert!(summary.success);
    assert!(dir.path().join("sub").join("marker").exists());
}

#[tokio::test]
async fn test_globals_substitute_into_commands() {
    let pipeline = PipelineDescriptor::new("Deploy")
        .global("expected", "release-7")
        .step(Step::local("check", "test :expected: = release-7"))
        .build();

    assert!(pipeline.run().await.success);
}

#[tokio::test]
async fn test_virtual_step_output_feeds_later_commands() {
    let pipeline = PipelineDescriptor::new("Deploy")
        .step(Step::virtual_step(
            "resolve target",
            virtual_fn(|ctx, emitter| async move {
                emitter.stdout("resolving\n");
                ctx.set_global("target", "blue");
                Ok(())
            }),
        ))
        .step(Step::local("verify", "test :target: = blue"))
        .build();

    let summary = pipeline.run().await;
    assert!(summary.success, "failure: {:?}", summary.failure);
}

#[tokio::test]
async fn test_dynamic_command_reads_the_context() {
    let pipeline = PipelineDescriptor::new("Deploy")
        .global("count", "3")
        .step(Step::local(
            "computed",
            convoy::Command::Dynamic(std::sync::Arc::new(|ctx: &convoy::Context| {
                let count = ctx.global("count").unwrap_or_default();
                Ok(format!("test {count} = 3"))
            })),
        ))
        .build();

    assert!(pipeline.run().await.success);
}

#[tokio::test]
async fn test_missing_remote_fails_without_connecting() {
    let pipeline = PipelineDescriptor::new("Deploy")
        .step(Step::remote("restart", "ghost", "systemctl restart app"))
        .build();
    let log = EventLog::attach(&pipeline);

    let summary = pipeline.run().await;

    assert!(!summary.success);
    assert_eq!(
        summary.failure.and_then(|f| f.error),
        Some("Remote not configred or unmatching remoteId provided".to_string())
    );
    assert_eq!(log.count("remote_connecting"), 0);
}

#[tokio::test]
async fn test_cancellation_stops_a_running_step() {
    let pipeline = PipelineDescriptor::new("Deploy")
        .step(Step::local("stalls", "sleep 30"))
        .step(Step::local("unreached", "true"))
        .build();

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let summary = pipeline.run_with_cancel(&cancel).await;

    assert!(!summary.success);
    assert_eq!(summary.steps_run, 1);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "cancellation should cut the sleep short"
    );
}

#[tokio::test]
async fn test_cancellation_skips_remaining_retries() {
    let mut step = Step::local("stalls", "sleep 30");
    step.policy.max_retries = 3;
    let pipeline = PipelineDescriptor::new("Deploy").step(step).build();
    let log = EventLog::attach(&pipeline);

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let summary = pipeline.run_with_cancel(&cancel).await;

    assert!(!summary.success);
    assert_eq!(log.retries(), 0, "a cancelled step must not re-attempt");
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "the retry budget must not keep the run alive after cancellation"
    );
}

#[tokio::test]
async fn test_step_timeout_halts_with_the_timeout_message() {
    let pipeline = PipelineDescriptor::new("Deploy")
        .step(
            Step::local("slow", "sleep 30").with_options(convoy::ExecOptions {
                timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            }),
        )
        .build();

    let summary = pipeline.run().await;

    assert!(!summary.success);
    assert_eq!(
        summary.failure.and_then(|f| f.error),
        Some("Local command timeout".to_string())
    );
}

#[tokio::test]
async fn test_history_reflects_settled_steps() {
    let pipeline = PipelineDescriptor::new("Deploy")
        .step(Step::local("first", "echo one"))
        .step(Step::local("second", "echo two"))
        .build();

    pipeline.run().await;

    let history = pipeline.context().history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].stdout.trim(), "one");
    assert_eq!(history[1].stdout.trim(), "two");
}
