//! End to end ticks of the driver against a directory store.

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{FakeClusterApi, FakeConnector, FakeNodeAgentInstaller, collaborators};
use orbiter::infra::RequirementCommand;
use orbiter::kinds::MachineCommand;
use orbiter::store::{
    CURRENT_PATH, DESIRED_PATH, Document, NODE_AGENTS_CURRENT_PATH, NODE_AGENTS_DESIRED_PATH,
};
use orbiter::{DocumentStore, Driver, Error, FsStore, Result, State};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const ORB: &str = r#"
kind: orbiter.io/Orb
version: v0
providers:
  static:
    kind: orbiter.io/StaticProvider
    version: v1
    spec:
      remoteUser: orbiter
      externalInterfaces: []
      privateInterface: eth0
      keys:
        bootstrapKeyPrivate: {value: bootstrap}
        maintenanceKeyPrivate: {value: maintenance}
        maintenanceKeyPublic: {value: ssh-ed25519 AAAA orbiter}
      pools:
        masters:
        - {id: m1, ip: 10.0.0.1}
        - {id: m2, ip: 10.0.0.2}
"#;

struct Fixture {
    _dir: TempDir,
    store: Arc<FsStore>,
    connector: Arc<FakeConnector>,
    installer: Arc<FakeNodeAgentInstaller>,
}

impl Fixture {
    async fn new(orb: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsStore::open(dir.path()).await.unwrap());
        store
            .commit(0, vec![Document::new(DESIRED_PATH, orb)], "seed")
            .await
            .unwrap();
        let connector = Arc::new(FakeConnector::default());
        connector
            .host("10.0.0.1")
            .activate("m1", "2021-01-01T00:00:00Z");
        Self {
            _dir: dir,
            store,
            connector,
            installer: Arc::new(FakeNodeAgentInstaller::default()),
        }
    }

    fn driver_on(&self, store: Arc<dyn DocumentStore>) -> Driver {
        let collab = collaborators(
            Arc::new(FakeClusterApi::default()),
            self.installer.clone(),
            self.connector.clone(),
        );
        Driver::new(store, collab, "orb", Duration::from_secs(600))
    }

    fn driver(&self) -> Driver {
        self.driver_on(self.store.clone())
    }

    async fn read(&self, path: &str) -> Option<String> {
        self.store
            .read(path)
            .await
            .unwrap()
            .map(|c| String::from_utf8(c).unwrap())
    }
}

#[tokio::test]
async fn test_tick_commits_observed_state() {
    let fx = Fixture::new(ORB).await;
    let mut driver = fx.driver();

    let mut done = false;
    for _ in 0..3 {
        done = assert_ok!(driver.tick(CancellationToken::new()).await);
        if done {
            break;
        }
    }
    assert!(done);
    assert_eq!(driver.state(), State::Converged);
    assert!(fx.installer.installed("m1"));
    assert!(!fx.installer.installed("m2"));

    let current = fx.read(CURRENT_PATH).await.unwrap();
    assert!(current.contains("m1"), "{current}");
    assert!(!current.contains("m2"), "{current}");
    assert!(fx.read(NODE_AGENTS_DESIRED_PATH).await.is_some());
    // Node agents own their current document.
    assert!(fx.read(NODE_AGENTS_CURRENT_PATH).await.is_none());

    let history = fx.store.history().await.unwrap();
    assert_eq!(history.last().unwrap().message, "orbiter: converged");
    // Nothing changed the desired document.
    assert!(
        history
            .iter()
            .skip(1)
            .all(|c| !c.paths.contains(&DESIRED_PATH.to_string()))
    );
}

#[tokio::test]
async fn test_configure_distributes_maintenance_key() {
    let fx = Fixture::new(ORB).await;
    let mut driver = fx.driver();

    assert_ok!(driver.configure().await);
    assert_eq!(
        fx.connector
            .host("10.0.0.1")
            .file("/home/orbiter/.ssh/authorized_keys")
            .as_deref(),
        Some("ssh-ed25519 AAAA orbiter\n")
    );
    // Inactive hosts are left alone.
    assert!(
        fx.connector
            .host("10.0.0.2")
            .file("/home/orbiter/.ssh/authorized_keys")
            .is_none()
    );
}

#[tokio::test]
async fn test_missing_desired_state_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FsStore::open(dir.path()).await.unwrap());
    let fx = Fixture::new(ORB).await;
    let mut driver = fx.driver_on(store.clone());

    let err = assert_err!(driver.tick(CancellationToken::new()).await);
    assert!(matches!(err, Error::Validation(_)), "{err}");
    assert!(!err.is_transient());
    assert_eq!(store.revision().await.unwrap(), 0);
}

#[tokio::test]
async fn test_commands_persist_requirements() {
    let fx = Fixture::new(ORB).await;
    let driver = fx.driver();
    let reboot =
        MachineCommand::parse("static.masters.m1", RequirementCommand::RequireReboot).unwrap();

    assert!(assert_ok!(driver.apply_commands(&[reboot.clone()]).await));
    let desired = fx.read(DESIRED_PATH).await.unwrap();
    assert!(desired.contains("rebootRequired: true"), "{desired}");

    let revision = fx.store.revision().await.unwrap();
    assert!(!assert_ok!(driver.apply_commands(&[reboot]).await));
    assert_eq!(fx.store.revision().await.unwrap(), revision);

    let unknown =
        MachineCommand::parse("static.masters.m9", RequirementCommand::RequireReboot).unwrap();
    let err = assert_err!(driver.apply_commands(&[unknown]).await);
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_machines_lists_active_addresses() {
    let fx = Fixture::new(ORB).await;
    let driver = fx.driver();
    assert_eq!(
        assert_ok!(driver.machines().await),
        vec!["static.masters.m1".to_string()]
    );
}

/// Lets another writer commit between every read and commit.
struct RacingStore {
    inner: Arc<FsStore>,
}

#[async_trait]
impl DocumentStore for RacingStore {
    async fn revision(&self) -> Result<u64> {
        self.inner.revision().await
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.inner.read(path).await
    }

    async fn commit(&self, base: u64, files: Vec<Document>, message: &str) -> Result<u64> {
        let head = self.inner.revision().await?;
        self.inner
            .commit(head, vec![Document::new("other.yml", "edited")], "concurrent edit")
            .await?;
        self.inner.commit(base, files, message).await
    }
}

#[tokio::test]
async fn test_concurrent_writer_is_a_transient_conflict() {
    let fx = Fixture::new(ORB).await;
    let mut driver = fx.driver_on(Arc::new(RacingStore {
        inner: fx.store.clone(),
    }));

    let err = assert_err!(driver.tick(CancellationToken::new()).await);
    assert!(matches!(err.root(), Error::Conflict { .. }), "{err}");
    assert!(err.is_transient());
    assert!(fx.read(CURRENT_PATH).await.is_none());
    assert_eq!(driver.state(), State::Converging);
}

#[tokio::test]
async fn test_destroy_truncates_internal_documents() {
    let fx = Fixture::new(ORB).await;
    let mut driver = fx.driver();
    assert_ok!(driver.tick(CancellationToken::new()).await);

    assert_ok!(driver.destroy().await);
    assert_eq!(fx.read(CURRENT_PATH).await.as_deref(), Some(""));
    assert_eq!(fx.read(NODE_AGENTS_DESIRED_PATH).await.as_deref(), Some(""));
    assert_eq!(fx.read(NODE_AGENTS_CURRENT_PATH).await.as_deref(), Some(""));
    assert!(fx.read(DESIRED_PATH).await.is_some());
    assert!(!fx.installer.installed("m1"));
    assert!(fx.connector.host("10.0.0.1").file("/var/orbiter/m1").is_none());
    assert!(assert_ok!(driver.machines().await).is_empty());

    // A truncated store is read as empty on the next tick.
    assert_ok!(driver.tick(CancellationToken::new()).await);
}

/// Keeps documents in memory and records every commit message.
#[derive(Default)]
struct MemStore {
    docs: Mutex<BTreeMap<String, Vec<u8>>>,
    log: Mutex<Vec<String>>,
}

impl MemStore {
    fn commits(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    fn last(&self) -> Option<String> {
        self.log.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl DocumentStore for MemStore {
    async fn revision(&self) -> Result<u64> {
        Ok(self.commits() as u64)
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.docs.lock().unwrap().get(path).cloned())
    }

    async fn commit(&self, base: u64, files: Vec<Document>, message: &str) -> Result<u64> {
        let mut log = self.log.lock().unwrap();
        let actual = log.len() as u64;
        if base != actual {
            return Err(Error::Conflict {
                expected: base,
                actual,
            });
        }
        let mut docs = self.docs.lock().unwrap();
        for file in files {
            docs.insert(file.path, file.content);
        }
        log.push(message.to_string());
        Ok(actual + 1)
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_rechecks_converged_orb_only_when_due() {
    let fx = Fixture::new(ORB).await;
    let store = Arc::new(MemStore::default());
    assert_ok!(
        store
            .commit(0, vec![Document::new(DESIRED_PATH, ORB)], "seed")
            .await
    );
    let mut driver = fx.driver_on(store.clone());
    let interval = Duration::from_secs(10);
    let trigger = Arc::new(Notify::new());
    let shutdown = CancellationToken::new();

    let script = async {
        while store.last().as_deref() != Some("orbiter: converged") {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        // Interval wakeups within the recheck period leave a converged orb alone.
        let converged = store.commits();
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(store.commits(), converged);

        // The recheck period of 600 seconds has not passed either.
        tokio::time::sleep(Duration::from_secs(500)).await;
        assert_eq!(store.commits(), converged);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let rechecked = store.commits();
        assert_eq!(rechecked, converged + 1);

        trigger.notify_one();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.commits(), rechecked + 1);

        shutdown.cancel();
    };
    tokio::join!(driver.run(interval, trigger.clone(), shutdown.clone()), script);

    assert_eq!(driver.state(), State::Converged);
}

#[tokio::test]
async fn test_failed_tick_keeps_state() {
    let fx = Fixture::new(ORB).await;
    let mut driver = fx.driver();
    while !assert_ok!(driver.tick(CancellationToken::new()).await) {}
    assert_eq!(driver.state(), State::Converged);

    let revision = fx.store.revision().await.unwrap();
    fx.store
        .commit(
            revision,
            vec![Document::new(DESIRED_PATH, "kind: orbiter.io/Nope\nversion: v0\n")],
            "broken edit",
        )
        .await
        .unwrap();
    let err = assert_err!(driver.tick(CancellationToken::new()).await);
    assert!(matches!(err.root(), Error::UnknownKind(_)), "{err}");
    assert_eq!(driver.state(), State::Converged);
}

#[tokio::test]
async fn test_verbosity_follows_desired_state() {
    let verbose = ORB.replace(
        "      remoteUser: orbiter\n",
        "      verbose: true\n      remoteUser: orbiter\n",
    );
    let fx = Fixture::new(&verbose).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook = seen.clone();
    let mut driver = fx
        .driver()
        .with_verbosity(move |v| hook.lock().unwrap().push(v));

    assert_ok!(driver.tick(CancellationToken::new()).await);
    assert_ok!(driver.tick(CancellationToken::new()).await);
    assert_eq!(*seen.lock().unwrap(), vec![true]);

    let revision = fx.store.revision().await.unwrap();
    fx.store
        .commit(revision, vec![Document::new(DESIRED_PATH, ORB)], "quiet")
        .await
        .unwrap();
    assert_ok!(driver.tick(CancellationToken::new()).await);
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);
}
