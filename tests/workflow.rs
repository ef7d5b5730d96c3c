use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use jobtree::core::{FileSpec, JobType, ToolRequirement, ToolVersion, WorkItem};
use jobtree::tree::JobTree;
use jobtree::workflow::Workflow;
use jobtree::WorkflowError;

fn types(wf: &Workflow) -> Vec<JobType> {
    wf.job_types()
}

#[test]
fn chain_text_parses_and_prints() {
    let wf = Workflow::from_chain("ModelToIdf->EnergyPlus->Ruby").unwrap();
    assert_eq!(
        types(&wf),
        vec![JobType::ModelToIdf, JobType::EnergyPlus, JobType::Ruby]
    );
    assert!(wf.is_linear());
    assert_eq!(wf.to_chain().unwrap(), "ModelToIdf->EnergyPlus->Ruby");

    let aliased: Workflow = "modeltoidf -> RadiancePreprocessor".parse().unwrap();
    assert_eq!(
        types(&aliased),
        vec![JobType::ModelToIdf, JobType::ModelToRadPreProcess]
    );

    assert!(Workflow::from_chain("").unwrap().is_empty());
}

#[test]
fn bad_chain_text_is_reported() {
    let err = Workflow::from_chain("EnergyPlus->Bogus").unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownJobType(ref t) if t == "Bogus"), "{:?}", err);

    let err = Workflow::from_chain("EnergyPlus->->Ruby").unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidChain { .. }), "{:?}", err);
}

#[test]
fn replace_jobs_splices_every_placeholder() {
    let mut wf = Workflow::new();
    wf.add_job(JobType::ModelToIdf);
    wf.add_placeholder("key");
    wf.add_job(JobType::EnergyPlus);
    wf.add_placeholder("key");

    let sub = Workflow::from_chain("Ruby->ExpandObjects").unwrap();
    let n = wf.replace_jobs("key", &sub).unwrap();

    assert_eq!(n, 2);
    assert_eq!(
        wf.to_chain().unwrap(),
        "ModelToIdf->Ruby->ExpandObjects->EnergyPlus->Ruby->ExpandObjects"
    );
}

#[test]
fn replace_jobs_with_single_type() {
    let mut wf = Workflow::new();
    wf.add_placeholder("sim");
    wf.add_job(JobType::EnergyPlusPostProcess);

    wf.replace_jobs_with_type("sim", JobType::EnergyPlus).unwrap();
    assert_eq!(wf.to_chain().unwrap(), "EnergyPlus->EnergyPlusPostProcess");

    let err = wf.replace_jobs_with_type("sim", JobType::EnergyPlus).unwrap_err();
    assert!(matches!(err, WorkflowError::PlaceholderNotFound(_)));

    let err = wf.replace_jobs("sim", &Workflow::new()).unwrap_err();
    assert!(matches!(err, WorkflowError::EmptyReplacement));
}

#[test]
fn replace_jobs_keeps_finished_continuation() {
    // placeholder root with a finished job attached
    let mut tree = JobTree::new(WorkItem::placeholder("k"), "out");
    let root = tree.root();
    let child = tree.add_job(WorkItem::new(JobType::Ruby));
    tree.add_child(root, child).unwrap();
    let fin = tree.add_job(WorkItem::new(JobType::Null));
    tree.set_finished_job(root, fin).unwrap();

    let mut wf = Workflow::from_job_tree(&tree);
    wf.replace_jobs("k", &Workflow::from_chain("ModelToIdf->EnergyPlus").unwrap())
        .unwrap();

    let built = wf.create("out", None).unwrap();
    let r = built.root();
    assert_eq!(built[r].descriptor.job_type, JobType::ModelToIdf);
    let f = built.finished_job(r).expect("finished job kept");
    assert_eq!(built[f].descriptor.job_type, JobType::Null);

    let ep = built.children(r)[0];
    assert_eq!(built[ep].descriptor.job_type, JobType::EnergyPlus);
    let ruby = built.children(ep)[0];
    assert_eq!(built[ruby].descriptor.job_type, JobType::Ruby);
}

#[test]
fn work_items_round_trip_linear_chain() {
    let wf = Workflow::from_chain("ExpandObjects->EnergyPlus->EnergyPlusPostProcess").unwrap();
    let items = wf.to_work_items().unwrap();
    assert_eq!(items.len(), 3);

    let back = Workflow::from_work_items(&items);
    assert_eq!(back, wf);
}

#[test]
fn work_items_refuse_workflow_params() {
    let mut wf = Workflow::from_chain("Null->Null->Null").unwrap();
    wf.set_flat_output(true);

    let err = wf.to_work_items().unwrap_err();
    assert!(matches!(err, WorkflowError::WorkflowParams(ref k) if k == "flatoutdir"), "{:?}", err);
    // Chain text carries no params, so it is still available.
    assert_eq!(wf.to_chain().unwrap(), "Null->Null->Null");

    wf.set_flat_output(false);
    let back = Workflow::from_work_items(&wf.to_work_items().unwrap());
    assert_eq!(back, wf);
}

#[test]
fn work_items_reject_branching() {
    let mut tree = JobTree::new(WorkItem::new(JobType::Null), "out");
    let root = tree.root();
    for _ in 0..2 {
        let c = tree.add_job(WorkItem::new(JobType::Null));
        tree.add_child(root, c).unwrap();
    }
    let wf = Workflow::from_job_tree(&tree);

    assert!(!wf.is_linear());
    let err = wf.to_work_items().unwrap_err();
    assert!(matches!(err, WorkflowError::NonLinear(_)), "{:?}", err);
}

#[test]
fn add_workflow_appends_at_tail() {
    let mut a = Workflow::from_chain("ModelToIdf").unwrap();
    let mut b = Workflow::from_chain("EnergyPlus->Ruby").unwrap();
    b.add_param("threads", "4");
    a.add_workflow(&b);

    assert_eq!(a.to_chain().unwrap(), "ModelToIdf->EnergyPlus->Ruby");
    assert_eq!(a.params.get("threads"), Some("4"));
    assert_eq!(a.tail_type(), Some(JobType::Ruby));
    assert_eq!(Workflow::new().tail_type(), None);

    let mut with_fin = Workflow::from_chain("Null").unwrap();
    with_fin.set_finished_workflow(&b).unwrap();
    assert!(!with_fin.is_linear());
    assert_eq!(with_fin.len(), 3);
}

#[test]
fn encode_decode_is_lossless() {
    let file = FileSpec {
        name: "in.osm".into(),
        timestamp: Some(Utc.with_ymd_and_hms(2013, 6, 1, 12, 30, 0).unwrap()),
        key: "osm".into(),
        path: PathBuf::from("/data/in.osm"),
        required: true,
        required_files: Vec::new(),
    }
    .with_required_file("http://example.org/weather.epw", "weather.epw");

    let item = WorkItem::new(JobType::EnergyPlus)
        .with_tool(ToolRequirement::new(
            "energyplus",
            "8.1".parse::<ToolVersion>().unwrap(),
            Some(PathBuf::from("/opt/ep/energyplus")),
        ))
        .with_tool(ToolRequirement::new(
            "expandobjects",
            ToolVersion {
                major: Some(8),
                minor: None,
                patch: Some(3),
            },
            None,
        ))
        .with_param("zeta", "1")
        .with_param("alpha", "2")
        .with_file(file);

    let mut wf = Workflow::new().with_name("roundtrip");
    wf.add_job(item);
    wf.add_placeholder("post");
    wf.set_flat_output(true);

    let text = wf.encode().unwrap();
    println!("{}", text);
    assert!(text.contains("\"jobkeyname\": \"post\""));
    assert!(text.contains("\"type\": \"EnergyPlus\""));
    assert!(text.contains("\"version\": \"8.1\""));
    assert!(text.contains("\"version\": \"8.*.3\""));

    let back = Workflow::decode(&text).unwrap();
    assert_eq!(back, wf);
    assert_eq!(back.encode().unwrap(), text);
}

#[test]
fn param_order_does_not_matter() {
    let a = WorkItem::new(JobType::Ruby).with_param("x", "1").with_param("y", "2");
    let b = WorkItem::new(JobType::Ruby).with_param("y", "2").with_param("x", "1");
    assert_eq!(a, b);
}

#[test]
fn key_ignores_name() {
    let a = Workflow::from_chain("EnergyPlus").unwrap().with_name("one");
    let b = Workflow::from_chain("EnergyPlus").unwrap().with_name("two");
    let c = Workflow::from_chain("Ruby").unwrap();
    assert_eq!(a.key().unwrap(), b.key().unwrap());
    assert_ne!(a.key().unwrap(), c.key().unwrap());
}

#[test]
fn create_makes_independent_trees() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("model.osm");
    std::fs::write(&input, "OS:Version").unwrap();

    let mut wf = Workflow::from_chain("ModelToIdf->EnergyPlus").unwrap();
    wf.add_param("units", "si");

    let t1 = wf.create(dir.path(), Some(&input)).unwrap();
    let t2 = wf.create(dir.path(), Some(&input)).unwrap();

    assert_ne!(t1.root_job().uuid, t2.root_job().uuid);
    assert_eq!(t1.len(), 2);

    let root = t1.root_job();
    assert_eq!(root.descriptor.files.len(), 1);
    assert_eq!(root.descriptor.files[0].key, "osm");
    assert!(root.descriptor.files[0].timestamp.is_some());

    let child = t1.children(t1.root())[0];
    assert_eq!(t1.all_params(child).get("units"), Some("si"));
    assert_eq!(t1[child].index, 1);

    assert!(matches!(
        Workflow::new().create(dir.path(), None),
        Err(WorkflowError::EmptyWorkflow)
    ));
}

#[test]
fn tool_versions_keep_inner_wildcards() {
    let v: ToolVersion = "8.*.3".parse().unwrap();
    assert_eq!(v.major, Some(8));
    assert_eq!(v.minor, None);
    assert_eq!(v.patch, Some(3));
    assert_eq!(v.to_string(), "8.*.3");
    assert!(v.matches(&ToolVersion::new(8, 4, 3)));
    assert!(!v.matches(&ToolVersion::new(8, 4, 2)));

    assert_eq!("8.*".parse::<ToolVersion>().unwrap().to_string(), "8");
    assert_eq!("*".parse::<ToolVersion>().unwrap(), ToolVersion::any());
    assert!("8.x".parse::<ToolVersion>().is_err());
}

#[test]
fn keyed_trees_share_a_key_per_run() {
    let wf = Workflow::from_chain("ModelToIdf->EnergyPlus").unwrap();
    let a = wf.create_keyed("out", None).unwrap();
    let b = wf.create_keyed("out", None).unwrap();
    let c = wf.create_keyed("elsewhere", None).unwrap();

    assert!(a.workflow_key().is_some());
    assert_eq!(a.workflow_key(), b.workflow_key());
    assert_ne!(a.workflow_key(), c.workflow_key());
    assert_ne!(a.root_job().uuid, b.root_job().uuid);
    assert!(wf.create("out", None).unwrap().workflow_key().is_none());
}
