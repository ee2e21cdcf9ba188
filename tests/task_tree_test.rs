//! Integration tests over nested task trees
//!
//! Exercises containers and decorators composed together: completion and
//! error propagation through nesting, cancellation cascades, progress
//! aggregation, and timer-driven behavior on both drivers.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use taskloom::{
    Composite, CompositeMode, Conditional, Failsafe, FnTask, Graph, ManualTask, ManualTimers,
    Retry, Task, TaskExt, TaskRef, TaskState, Timeout, TimerDriverRef, TokioTimers,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn test_graph_of_composites_completes_in_dependency_order() {
    init_tracing();
    // Two fetch stages run in parallel; the merge stage waits for both.
    let fetch_a = ManualTask::named("fetch-a");
    let fetch_b = ManualTask::named("fetch-b");
    let fetches = Composite::named("fetches", CompositeMode::Parallel);
    fetches.add(fetch_a.handle()).unwrap();
    fetches.add(fetch_b.handle()).unwrap();

    let merge = FnTask::named("merge", || Ok(Some(serde_json::json!("merged"))));

    let graph = Graph::named("pipeline");
    let fetches_ref: TaskRef = fetches.clone();
    let merge_ref: TaskRef = merge.clone();
    graph.add(fetches_ref.clone()).unwrap();
    graph
        .add_with_blockers(merge_ref, &[fetches_ref])
        .unwrap();

    graph.run().unwrap();
    assert_eq!(fetch_a.state(), TaskState::Running);
    assert_eq!(merge.state(), TaskState::Initialized);

    fetch_a.finish(None).unwrap();
    assert_eq!(merge.state(), TaskState::Initialized);

    fetch_b.finish(None).unwrap();
    // The composite completed, unblocking the merge, which completes
    // synchronously and finishes the whole graph.
    assert_eq!(fetches.state(), TaskState::Completed);
    assert_eq!(merge.state(), TaskState::Completed);
    assert_eq!(graph.state(), TaskState::Completed);
}

#[test]
fn test_interrupt_cascades_through_nesting() {
    init_tracing();
    let leaf_a = ManualTask::new();
    let leaf_b = ManualTask::new();
    let inner = Composite::new(CompositeMode::Parallel);
    inner.add(leaf_a.handle()).unwrap();
    inner.add(leaf_b.handle()).unwrap();

    let graph = Graph::new();
    graph.add(inner.clone()).unwrap();
    graph.run().unwrap();
    assert_eq!(leaf_a.state(), TaskState::Running);

    graph.interrupt().unwrap();
    assert_eq!(inner.state(), TaskState::Interrupted);
    assert_eq!(leaf_a.state(), TaskState::Interrupted);
    assert_eq!(leaf_b.state(), TaskState::Interrupted);

    // Resume picks the whole tree back up and runs it to completion.
    graph.run().unwrap();
    assert_eq!(leaf_a.state(), TaskState::Running);
    leaf_a.finish(None).unwrap();
    leaf_b.finish(None).unwrap();
    assert_eq!(graph.state(), TaskState::Completed);
}

#[test]
fn test_decorated_children_inside_serial_composite() {
    // A flaky step wrapped in Retry, a best-effort step wrapped in
    // Failsafe; the pipeline completes despite both misbehaving.
    let attempts = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&attempts);
    let flaky = FnTask::named("flaky", move || {
        *counter.borrow_mut() += 1;
        if *counter.borrow() < 3 {
            Err("transient".to_string())
        } else {
            Ok(None)
        }
    });
    let doomed = FnTask::named("doomed", || Err("always fails".to_string()));

    let pipeline = Composite::new(CompositeMode::Serial);
    pipeline.add(Retry::with_max_retries(flaky, 5)).unwrap();
    pipeline.add(Failsafe::new(doomed)).unwrap();
    pipeline.add(FnTask::named("final", || Ok(None))).unwrap();

    pipeline.run().unwrap();
    assert_eq!(pipeline.state(), TaskState::Completed);
    assert_eq!(*attempts.borrow(), 3);
}

#[test]
fn test_progress_aggregates_over_the_whole_tree() {
    let inner = Composite::new(CompositeMode::Serial);
    let step_one = ManualTask::new();
    let step_two = ManualTask::new();
    inner.add(step_one.handle()).unwrap();
    inner.add(step_two.handle()).unwrap();

    let graph = Graph::new();
    let side = ManualTask::new();
    graph.add(inner.clone()).unwrap();
    graph.add(side.handle()).unwrap();

    assert_eq!(graph.operations_count(), 3);
    assert_eq!(graph.completed_operations_count(), 0);

    graph.run().unwrap();
    step_one.finish(None).unwrap();
    assert_eq!(graph.completed_operations_count(), 1);

    step_two.finish(None).unwrap();
    side.finish(None).unwrap();
    assert_eq!(graph.completed_operations_count(), 3);
    assert_eq!(graph.state(), TaskState::Completed);
}

#[test]
fn test_conditional_inside_graph_selects_and_feeds_dependents() {
    // A conditional picks a data source; a downstream consumer waits
    // for the decision.
    let use_cache = ManualTask::named("use-cache");
    let cached = FnTask::named("cached", || Ok(Some(serde_json::json!("cache"))));
    let network = FnTask::named("network", || Ok(Some(serde_json::json!("net"))));

    let source = Conditional::named("source");
    source
        .add_outcome(cached.clone(), vec![use_cache.handle()])
        .unwrap();
    source.add_outcome(network.clone(), vec![]).unwrap();

    let consumer = ManualTask::named("consumer");

    let graph = Graph::new();
    let source_ref: TaskRef = source.clone();
    graph.add(source_ref.clone()).unwrap();
    graph
        .add_with_blockers(consumer.handle(), &[source_ref])
        .unwrap();

    graph.run().unwrap();
    assert_eq!(consumer.state(), TaskState::Initialized);

    use_cache.finish(None).unwrap();
    assert_eq!(source.state(), TaskState::Completed);
    assert_eq!(source.data(), Some(serde_json::json!("cache")));
    assert_eq!(consumer.state(), TaskState::Running);

    consumer.finish(None).unwrap();
    assert_eq!(graph.state(), TaskState::Completed);
}

#[test]
fn test_timeout_around_retry_with_manual_timers() {
    // Retry keeps re-running a doomed child with a delay; the outer
    // timeout gives up first.
    let timers = ManualTimers::new();
    let doomed = FnTask::new(|| Err("never works".to_string()));
    let retry = Retry::with_delay(doomed, 10, Duration::from_millis(40), timers.clone());
    let timeout = Timeout::new(retry.clone(), Duration::from_millis(100), timers.clone());

    timeout.run().unwrap();
    assert_eq!(timeout.state(), TaskState::Running);

    // Two retries happen at t=40 and t=80, then the deadline at t=100.
    timers.advance(Duration::from_millis(100));
    assert_eq!(timeout.state(), TaskState::Errored);
    assert_eq!(
        timeout.error_message(),
        Some("timed out after 100ms".to_string())
    );
    assert_eq!(retry.state(), TaskState::Interrupted);
    assert_eq!(retry.retries(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_with_tokio_timers() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let timers: TimerDriverRef = TokioTimers::new();
            let child = ManualTask::new();
            let timeout = Timeout::new(child.handle(), Duration::from_millis(50), timers);

            timeout.run().unwrap();
            assert_eq!(timeout.state(), TaskState::Running);

            tokio::time::sleep(Duration::from_millis(60)).await;
            assert_eq!(timeout.state(), TaskState::Errored);
            assert_eq!(child.state(), TaskState::Interrupted);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_delayed_retry_with_tokio_timers() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let timers: TimerDriverRef = TokioTimers::new();
            let attempts = Rc::new(RefCell::new(0));
            let counter = Rc::clone(&attempts);
            let flaky = FnTask::new(move || {
                *counter.borrow_mut() += 1;
                if *counter.borrow() < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(None)
                }
            });
            let retry = Retry::with_delay(flaky, 3, Duration::from_millis(20), timers);

            retry.run().unwrap();
            assert_eq!(*attempts.borrow(), 1);

            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(*attempts.borrow(), 2);
            assert_eq!(retry.state(), TaskState::Completed);
        })
        .await;
}
