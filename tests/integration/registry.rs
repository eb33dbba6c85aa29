//! Named composition and cycle rejection.

use gantry::core::{Compose, Registry, Task, TaskKind};
use gantry::orchestration::run;
use gantry::Error;

use crate::fixtures::{recording, Journal};

fn site_registry(journal: &Journal) -> Registry {
    let mut registry = Registry::new();
    for name in ["clean", "style", "script", "page", "useref", "image", "upload"] {
        registry.register(name, recording(name, journal)).unwrap();
    }
    registry
        .parallel("compile", &["style", "script", "page"])
        .unwrap();
    registry
        .compose(
            "build",
            Compose::series([
                Compose::task("clean"),
                Compose::parallel([
                    Compose::series([Compose::task("compile"), Compose::task("useref")]),
                    Compose::task("image"),
                ]),
            ]),
        )
        .unwrap();
    registry.series("deploy", &["build", "upload"]).unwrap();
    registry
}

/// Test: Composed pipelines run like hand-built trees
/// Given build and deploy defined by name
/// When deploy is resolved and run
/// Then every step runs once, clean first and upload last
#[tokio::test]
async fn test_resolved_pipeline_runs() {
    let journal = Journal::new();
    let registry = site_registry(&journal);

    let deploy = registry.resolve("deploy").unwrap();
    let report = run(&deploy).await.unwrap();

    assert!(report.is_success());
    let entries = journal.entries();
    assert_eq!(entries.len(), 7);
    assert_eq!(entries.first().map(String::as_str), Some("clean"));
    assert_eq!(entries.last().map(String::as_str), Some("upload"));
    assert!(journal.position("useref") > journal.position("page"));
}

/// Test: A definition that closes a loop is rejected
/// Given build -> compile -> style
/// When style is redefined in terms of deploy, or compile in terms of build
/// Then the definition fails with a cycle error and the registry is unchanged
#[test]
fn test_cycle_rejected_at_composition() {
    let journal = Journal::new();
    let mut registry = Registry::new();
    registry.series("build", &["compile"]).unwrap();
    registry.parallel("compile", &["style", "watch"]).unwrap();
    registry.register("style", Task::noop("style")).unwrap();

    match registry.series("watch", &["build"]) {
        Err(Error::Cycle { task, via }) => {
            assert_eq!(task, "watch");
            assert_eq!(via, "build");
        }
        other => panic!("Expected cycle error, got {:?}", other),
    }

    assert!(!registry.contains("watch"));
    assert!(registry.dependencies("watch").is_empty());
    assert_eq!(registry.undefined(), vec!["watch"]);

    // The rejected edges are gone, so an acyclic definition still works.
    registry
        .register("watch", recording("watch", &journal))
        .unwrap();
    registry.validate().unwrap();
    assert_eq!(registry.kind_of("build"), Some(TaskKind::Series));
}

/// Test: A task cannot contain itself
/// Given an empty registry
/// When `build` is defined as series(clean, build)
/// Then it is rejected with a cycle through itself
#[test]
fn test_self_reference_rejected() {
    let mut registry = Registry::new();
    registry.register("clean", Task::noop("clean")).unwrap();

    let err = registry.series("build", &["clean", "build"]).unwrap_err();
    assert!(matches!(err, Error::Cycle { ref task, ref via } if task == "build" && via == "build"));
    assert!(registry.resolve("build").is_err());
}

/// Test: Forward references resolve once defined
/// Given start referencing build before build exists
/// When build is defined afterwards
/// Then start resolves to the full tree
#[test]
fn test_forward_reference() {
    let journal = Journal::new();
    let mut registry = Registry::new();
    registry.series("start", &["build", "serve"]).unwrap();

    assert!(matches!(registry.validate(), Err(Error::UnknownTask(_))));
    assert!(matches!(
        registry.resolve("start"),
        Err(Error::UnknownTask(name)) if name == "build"
    ));

    registry.register("build", recording("build", &journal)).unwrap();
    registry.register("serve", recording("serve", &journal)).unwrap();
    registry.validate().unwrap();

    let start = registry.resolve("start").unwrap();
    assert_eq!(start.describe(), "start [series]\n  build [atomic]\n  serve [atomic]\n");
}

/// Test: Shared definitions resolve to one value
/// Given start and deploy both referencing build
/// When both are resolved together under one parent
/// Then each occurrence of build is the same task value
#[test]
fn test_shared_definition() {
    let journal = Journal::new();
    let mut registry = site_registry(&journal);
    registry.series("all", &["build", "deploy"]).unwrap();

    let all = registry.resolve("all").unwrap();
    let direct = &all.children()[0];
    let via_deploy = &all.children()[1].children()[0];
    assert!(direct.ptr_eq(via_deploy));
    assert_eq!(registry.names().len(), 11);
}
