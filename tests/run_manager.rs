use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use jobtree::checkpoint::CheckpointStore;
use jobtree::config::RunConfig;
use jobtree::core::{FileSpec, JobStatus, JobType, TreeStatus, WorkItem};
use jobtree::drivers::{DriverRegistry, JobContext, JobDriver, JobOutput};
use jobtree::runmanager::RunManager;
use jobtree::tree::{JobId, JobTree};
use jobtree::workflow::Workflow;

const LIMIT: Duration = Duration::from_secs(30);

/// Sleeps a little, drops a marker file, and fails on request
/// (own param "fail", not inherited).
struct StubDriver {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl JobDriver for StubDriver {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        if ctx.descriptor.params.has("fail") {
            bail!("stub failure in job {}", ctx.index);
        }
        let marker = ctx.output_dir.join(format!("job-{}.txt", ctx.index));
        tokio::fs::write(&marker, ctx.job_type().name()).await?;
        Ok(JobOutput {
            output_files: vec![FileSpec::from_path(&marker, None)],
            ..JobOutput::default()
        })
    }
}

fn manager_with(slots: usize, runs: Arc<AtomicUsize>) -> RunManager {
    let cfg = RunConfig {
        max_local_jobs: slots,
        ..RunConfig::default()
    };
    RunManager::builder(cfg)
        .drivers(DriverRegistry::uniform(StubDriver { runs }))
        .build()
}

fn manager(slots: usize) -> RunManager {
    manager_with(slots, Arc::new(AtomicUsize::new(0)))
}

fn chain_under(tree: &mut JobTree, parent: JobId, n: usize) -> Vec<JobId> {
    let mut out = Vec::new();
    let mut cursor = parent;
    for _ in 0..n {
        let id = tree.add_job(WorkItem::new(JobType::Null));
        tree.add_child(cursor, id).unwrap();
        out.push(id);
        cursor = id;
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_job_runs_after_every_branch() {
    let dir = tempfile::tempdir().unwrap();
    let mut tree = JobTree::new(WorkItem::new(JobType::Null), dir.path());
    let root = tree.root();

    let mut branches = Vec::new();
    for _ in 0..3 {
        branches.extend(chain_under(&mut tree, root, 5));
    }
    let fin_first = tree.add_job(WorkItem::new(JobType::Null));
    tree.set_finished_job(root, fin_first).unwrap();
    let mut fin = vec![fin_first];
    fin.extend(chain_under(&mut tree, fin_first, 4));

    let rm = manager(4);
    let h = rm.enqueue(tree, false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await, "timed out");

    let tree = rm.tree(h).unwrap();
    assert_eq!(tree.tree_status(), TreeStatus::Finished);
    for id in &branches {
        assert!(
            tree.ran_before(*id, fin_first),
            "branch job {} finished after the finished job",
            tree[*id].index
        );
    }
    for pair in fin.windows(2) {
        assert!(tree.ran_before(pair[0], pair[1]));
    }
    let last = *fin.last().unwrap();
    assert_eq!(tree.tree_last_run(), tree[last].last_run);
    assert!(tree.tree_last_run().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_stops_subtree_but_finished_job_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut tree = JobTree::new(WorkItem::new(JobType::Null), dir.path());
    let root = tree.root();

    let bad = tree.add_job(WorkItem::new(JobType::Null).with_param("fail", "1"));
    tree.add_child(root, bad).unwrap();
    let below_bad = chain_under(&mut tree, bad, 2);
    let good = chain_under(&mut tree, root, 3);
    let fin = tree.add_job(WorkItem::new(JobType::Null));
    tree.set_finished_job(root, fin).unwrap();
    let after_fin = chain_under(&mut tree, fin, 1)[0];

    let rm = manager(2);
    let h = rm.enqueue(tree, false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await, "timed out");

    let tree = rm.tree(h).unwrap();
    assert_eq!(tree.tree_status(), TreeStatus::Failed);
    assert_eq!(tree[bad].status, JobStatus::Failed);
    assert!(!tree[bad].succeeded());
    assert!(tree[bad].errors.errors().any(|e| e.contains("stub failure")));
    for id in below_bad {
        assert_eq!(tree[id].status, JobStatus::NotStarted);
    }
    for id in good {
        assert_eq!(tree[id].status, JobStatus::Succeeded);
    }
    assert_eq!(tree[fin].status, JobStatus::Succeeded);
    assert!(tree[after_fin].last_run.is_some());
    assert_eq!(rm.tree_status(h), Some(TreeStatus::Failed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_manager_holds_work_until_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let cfg = RunConfig {
        max_local_jobs: 2,
        ..RunConfig::default()
    };
    let rm = RunManager::builder(cfg)
        .drivers(DriverRegistry::uniform(StubDriver { runs: runs.clone() }))
        .paused(true)
        .build();

    let tree = Workflow::from_chain("Null->Null->Null")
        .unwrap()
        .create(dir.path(), None)
        .unwrap();
    rm.enqueue(tree, false);

    assert!(!rm.wait_for_finished_timeout(Duration::from_millis(200)).await);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(rm.get_jobs().iter().all(|j| j.status == JobStatus::NotStarted));

    rm.set_paused(false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert!(!rm.paused());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_jobs_lists_queue_in_order_with_global_indices() {
    let dir = tempfile::tempdir().unwrap();
    let mut wf = Workflow::from_chain("Null->Null->Null->Null->Null").unwrap();
    wf.set_flat_output(true);

    let rm = manager(1);
    rm.set_paused(true);
    rm.enqueue(wf.create(dir.path().join("a"), None).unwrap(), false);
    rm.enqueue(wf.create(dir.path().join("b"), None).unwrap(), false);

    let jobs = rm.get_jobs();
    assert_eq!(jobs.len(), 10);
    for (i, j) in jobs.iter().enumerate() {
        assert_eq!(j.index, i);
    }
    assert_eq!(jobs[0].output_dir, dir.path().join("a").join("0-Null"));
    assert_eq!(jobs[6].output_dir, dir.path().join("b").join("6-Null-0"));

    rm.set_paused(false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);
    for j in rm.get_jobs() {
        assert!(j.output_dir.join(format!("job-{}.txt", j.index)).exists());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn statistics_count_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let mut tree = JobTree::new(WorkItem::new(JobType::Null), dir.path());
    let root = tree.root();
    chain_under(&mut tree, root, 2);
    let bad = tree.add_job(WorkItem::new(JobType::Null).with_param("fail", "1"));
    tree.add_child(root, bad).unwrap();

    let rm = manager(2);
    rm.enqueue(tree, false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);

    let stats = rm.statistics();
    println!("{}", stats);
    assert_eq!(stats.workflows, 1);
    assert_eq!(stats.jobs, 4);
    assert_eq!(stats.succeeded, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.running_workflows, 0);
    assert!(stats.average_completion_secs >= 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn up_to_date_trees_are_not_rerun_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let rm = manager_with(2, runs.clone());

    let tree = Workflow::from_chain("Null->Null")
        .unwrap()
        .create(dir.path(), None)
        .unwrap();
    let h = rm.enqueue(tree, false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    let done = rm.tree(h).unwrap();
    rm.clear_jobs();
    assert!(rm.trees().is_empty());

    rm.enqueue(done.clone(), false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    let h = rm.enqueue(done, true);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert!(!rm.tree(h).unwrap().root_job().forced);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_out_of_date_reruns_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let aux = dir.path().join("schedule.csv");
    std::fs::write(&aux, "1,2,3").unwrap();

    let mut spec = FileSpec::from_path(&aux, Some("csv"));
    spec.required = false;
    let mut wf = Workflow::new();
    wf.add_job(WorkItem::new(JobType::Null).with_file(spec));
    wf.add_job(JobType::Null);
    wf.add_job(JobType::Null);

    let runs = Arc::new(AtomicUsize::new(0));
    let rm = manager_with(2, runs.clone());
    let h = rm.enqueue(wf.create(dir.path().join("out"), None).unwrap(), false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);
    assert_eq!(rm.restart_out_of_date(), 0);

    std::fs::remove_file(&aux).unwrap();
    assert_eq!(rm.restart_out_of_date(), 3);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);

    assert_eq!(runs.load(Ordering::SeqCst), 6);
    assert_eq!(rm.tree_status(h), Some(TreeStatus::Finished));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_required_input_fails_job() {
    let dir = tempfile::tempdir().unwrap();
    let wf = Workflow::from_chain("Null->Null").unwrap();
    let tree = wf
        .create(dir.path(), Some(&dir.path().join("absent.idf")))
        .unwrap();

    let rm = manager(1);
    let h = rm.enqueue(tree, false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);

    let tree = rm.tree(h).unwrap();
    assert_eq!(tree.tree_status(), TreeStatus::Failed);
    assert!(tree.root_job().errors.errors().any(|e| e.contains("absent.idf")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresolvable_tool_fails_job() {
    let dir = tempfile::tempdir().unwrap();
    let tree = Workflow::from_chain("EnergyPlus")
        .unwrap()
        .create(dir.path(), None)
        .unwrap();

    // Default registry: EnergyPlus goes to the process driver.
    let rm = RunManager::new(RunConfig {
        max_local_jobs: 1,
        ..RunConfig::default()
    });
    let h = rm.enqueue(tree, false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);

    let tree = rm.tree(h).unwrap();
    assert_eq!(tree.root_job().status, JobStatus::Failed);
    assert!(tree.root_job().errors.errors().any(|e| e.contains("energyplus")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkpointed_trees_resume_in_a_new_manager() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobtree.db");

    let first = RunManager::builder(RunConfig::default())
        .drivers(DriverRegistry::uniform(StubDriver {
            runs: Arc::new(AtomicUsize::new(0)),
        }))
        .store(CheckpointStore::open(&db).unwrap())
        .paused(true)
        .build();
    let tree = Workflow::from_chain("Null->Null->Null")
        .unwrap()
        .create(dir.path().join("out"), None)
        .unwrap();
    let h = first.enqueue(tree, false);
    first.sync_checkpoints().await;
    drop(first);

    let runs = Arc::new(AtomicUsize::new(0));
    let second = RunManager::builder(RunConfig::default())
        .drivers(DriverRegistry::uniform(StubDriver { runs: runs.clone() }))
        .store(CheckpointStore::open(&db).unwrap())
        .build();
    assert_eq!(second.load_jobs().unwrap(), 1);
    assert_eq!(second.trees(), vec![h]);
    assert!(second.wait_for_finished_timeout(LIMIT).await);
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    // The completed state was checkpointed too.
    let store = CheckpointStore::open(&db).unwrap();
    let saved = store.restore_trees().unwrap();
    assert_eq!(saved[0].1.tree_status(), TreeStatus::Finished);

    second.remove(h).expect("queued");
    second.sync_checkpoints().await;
    assert!(store.restore_trees().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tool_less_job_types_complete_with_default_drivers() {
    let dir = tempfile::tempdir().unwrap();
    let tree = Workflow::from_chain("ModelToIdf->EnergyPlusPostProcess->IdfToModel")
        .unwrap()
        .create(dir.path(), None)
        .unwrap();

    let rm = RunManager::new(RunConfig {
        max_local_jobs: 2,
        ..RunConfig::default()
    });
    let h = rm.enqueue(tree, false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);

    let tree = rm.tree(h).unwrap();
    println!("{:?}", tree.tree_errors());
    assert_eq!(tree.tree_status(), TreeStatus::Finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_workflow_key_restarts_the_queued_tree() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let wf = Workflow::from_chain("Null->Null").unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let rm = manager_with(2, runs.clone());
    let h = rm.enqueue(wf.create_keyed(&out, None).unwrap(), false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // Up to date: nothing runs, nothing is added.
    let again = rm.enqueue(wf.create_keyed(&out, None).unwrap(), false);
    assert_eq!(again, h);
    assert_eq!(rm.trees(), vec![h]);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // Forced: the queued tree runs again.
    let forced = rm.enqueue(wf.create_keyed(&out, None).unwrap(), true);
    assert_eq!(forced, h);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(rm.tree_status(h), Some(TreeStatus::Finished));
    assert!(!rm.tree(h).unwrap().root_job().forced);

    let other = rm.enqueue(wf.create_keyed(dir.path().join("other"), None).unwrap(), false);
    assert_ne!(other, h);
    assert_eq!(rm.trees().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raised_tree_gets_the_next_free_slot() {
    let dir = tempfile::tempdir().unwrap();
    let wf = Workflow::from_chain("Null").unwrap();

    let rm = manager(1);
    rm.set_paused(true);
    let a = rm.enqueue(wf.create(dir.path().join("a"), None).unwrap(), false);
    let b = rm.enqueue(wf.create(dir.path().join("b"), None).unwrap(), false);

    assert!(!rm.raise_priority(a));
    assert!(!rm.lower_priority(b));
    assert!(rm.raise_priority(b));
    assert_eq!(rm.trees(), vec![b, a]);
    assert_eq!(rm.get_jobs()[0].tree, b);

    rm.set_paused(false);
    assert!(rm.wait_for_finished_timeout(LIMIT).await);

    let first = rm.tree(b).unwrap().root_job().last_run.unwrap();
    let second = rm.tree(a).unwrap().root_job().last_run.unwrap();
    assert!(first < second, "raised tree should run first");

    assert!(rm.lower_priority(b));
    assert_eq!(rm.trees(), vec![a, b]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkpointing_does_not_stall_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobtree.db");
    let runs = Arc::new(AtomicUsize::new(0));
    let rm = RunManager::builder(RunConfig {
        max_local_jobs: 4,
        ..RunConfig::default()
    })
    .drivers(DriverRegistry::uniform(StubDriver { runs: runs.clone() }))
    .store(CheckpointStore::open(&db).unwrap())
    .build();

    let mut handles = Vec::new();
    for i in 0..4 {
        let tree = Workflow::from_chain("Null->Null->Null")
            .unwrap()
            .create(dir.path().join(format!("t{}", i)), None)
            .unwrap();
        handles.push(rm.enqueue(tree, false));
    }
    assert!(rm.wait_for_finished_timeout(LIMIT).await);
    assert_eq!(runs.load(Ordering::SeqCst), 12);

    // wait_for_finished returns only after the final states are written.
    let saved = CheckpointStore::open(&db).unwrap().restore_trees().unwrap();
    assert_eq!(saved.len(), 4);
    for (handle, tree) in saved {
        assert!(handles.contains(&handle));
        assert_eq!(tree.tree_status(), TreeStatus::Finished);
    }
}
