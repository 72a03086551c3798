// src/actions/mod.rs

//! Build-action runtime
//!
//! Build actions are long-running asynchronous operations against the
//! shared configuration: reloading dependency data, preparing and
//! conducting builds, and mutating repositories. Each action walks the
//! lifecycle `Created → Enqueued → [AwaitingConfirmation →] Running →
//! Finished`; the terminal state is always `Finished` with the outcome in
//! `result`. Transitions are serialized by the runtime's `building` write
//! lock. Finished actions are retained in the history.

pub mod conduct_build;
pub mod custom_command;
pub mod meta;
pub mod misc;
pub mod prepare_build;
pub mod process;
pub mod reload_library_dependencies;
pub mod repo_management;

use crate::config::Config;
use crate::database::{DatabaseId, PackageUpdates, UnresolvedDependencies};
use crate::storage::StorageEnvironment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;
use tracing::info;

pub use conduct_build::BuildProgress;
pub use meta::{build_action_meta, BuildActionTypeMetaInfo};
pub use prepare_build::BuildPreparation;

/// The type of a build action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildActionType {
    Invalid,
    RemovePackages,
    MovePackages,
    CheckForUpdates,
    ReloadDatabase,
    ReloadLibraryDependencies,
    PrepareBuild,
    ConductBuild,
    MakeLicenseInfo,
    CheckForProblems,
    CleanRepository,
    DummyBuildAction,
    CustomCommand,
}

/// Lifecycle state of a build action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildActionStatus {
    Created,
    Enqueued,
    AwaitingConfirmation,
    Running,
    Finished,
}

/// Outcome of a finished build action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildActionResult {
    None,
    Success,
    Failure,
    ConfirmationDeclined,
    Aborted,
}

/// Errors, warnings and notes accumulated by an action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildActionMessages {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}

/// One problem found by the check-for-problems action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryProblem {
    pub desc: RepositoryProblemDesc,
    pub pkg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RepositoryProblemDesc {
    Message(String),
    Unresolved(UnresolvedDependencies),
}

/// Per-package outcome of a repository-mutation action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageMovementResult {
    pub failed_packages: Vec<(String, String)>,
    pub processed_packages: Vec<String>,
    pub error_message: String,
}

/// Typed result data surfaced on a finished action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum BuildActionResultData {
    #[default]
    None,
    Error(String),
    Messages(BuildActionMessages),
    MovementResult(PackageMovementResult),
    BuildPreparation(BuildPreparation),
    BuildProgress(BuildProgress),
    RepoProblems(HashMap<String, Vec<RepositoryProblem>>),
    PackageUpdates(PackageUpdates),
    LicenseResult(crate::config::LicenseResult),
}

/// A build action's data; mutated only by its owner or under the
/// runtime's lock
#[derive(Debug)]
pub struct BuildAction {
    pub id: u64,
    pub action_type: BuildActionType,
    pub flags: u64,
    pub status: BuildActionStatus,
    pub result: BuildActionResult,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub directory: String,
    /// Source database denotations (`name@arch`)
    pub source_dbs: Vec<String>,
    pub destination_dbs: Vec<String>,
    pub package_names: Vec<String>,
    pub settings: HashMap<String, String>,
    /// Append-only output buffer
    pub output: String,
    pub result_data: BuildActionResultData,
    /// Whether the action must be confirmed before running
    pub requires_confirmation: bool,
}

impl BuildAction {
    fn new(id: u64, action_type: BuildActionType) -> Self {
        Self {
            id,
            action_type,
            flags: 0,
            status: BuildActionStatus::Created,
            result: BuildActionResult::None,
            created: Utc::now(),
            started: None,
            finished: None,
            directory: String::new(),
            source_dbs: Vec::new(),
            destination_dbs: Vec::new(),
            package_names: Vec::new(),
            settings: HashMap::new(),
            output: String::new(),
            result_data: BuildActionResultData::None,
            requires_confirmation: false,
        }
    }
}

/// Shared handle to one build action
pub struct ActionHandle {
    data: Mutex<BuildAction>,
    aborted: AtomicBool,
    confirmed: AtomicBool,
    conclude_handler: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ActionHandle {
    pub fn new(id: u64, action_type: BuildActionType) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(BuildAction::new(id, action_type)),
            aborted: AtomicBool::new(false),
            confirmed: AtomicBool::new(false),
            conclude_handler: Mutex::new(None),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, BuildAction> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a line to the action's output buffer
    pub fn append_output(&self, text: impl AsRef<str>) {
        self.lock().output.push_str(text.as_ref());
    }

    /// Cooperative cancellation; checked by actions at safe points
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// One-shot handler fired on the `Running → Finished` transition
    pub fn set_conclude_handler(&self, handler: Box<dyn FnOnce() + Send>) {
        *self
            .conclude_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Finish the action under the building write lock
    pub async fn finish(
        &self,
        setup: &ServiceSetup,
        result: BuildActionResult,
        data: BuildActionResultData,
    ) {
        let _building = setup.building.write().await;
        {
            let mut action = self.lock();
            action.status = BuildActionStatus::Finished;
            action.result = result;
            action.finished = Some(Utc::now());
            if !matches!(data, BuildActionResultData::None) {
                action.result_data = data;
            }
            info!("action {} finished with {:?}", action.id, result);
        }
        if let Some(handler) = self
            .conclude_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handler();
        }
    }

    pub async fn report_error(&self, setup: &ServiceSetup, message: impl Into<String>) {
        let message = message.into();
        self.append_output(format!("ERROR: {}\n", message));
        self.finish(
            setup,
            BuildActionResult::Failure,
            BuildActionResultData::Error(message),
        )
        .await;
    }

    pub async fn report_success(&self, setup: &ServiceSetup) {
        self.finish(setup, BuildActionResult::Success, BuildActionResultData::None)
            .await;
    }

    /// Check the abort flag; when set, finish with `Aborted` and return
    /// true
    pub async fn report_aborted_if_aborted(&self, setup: &ServiceSetup) -> bool {
        if !self.is_aborted() {
            return false;
        }
        self.finish(setup, BuildActionResult::Aborted, BuildActionResultData::None)
            .await;
        true
    }

    /// Start the action: validate parameters, transition to `Running` (or
    /// `AwaitingConfirmation`) and invoke the type-specific run
    pub async fn start(self: Arc<Self>, setup: &Arc<ServiceSetup>) {
        let this = &self;
        let action_type = {
            let _building = setup.building.write().await;
            let mut action = this.lock();
            action.status = BuildActionStatus::Enqueued;
            action.action_type
        };

        if let Some(error) = this.validate_against_meta(action_type) {
            this.report_error(setup, error).await;
            return;
        }

        {
            let _building = setup.building.write().await;
            let mut action = this.lock();
            if action.requires_confirmation && !this.confirmed.load(Ordering::Relaxed) {
                action.status = BuildActionStatus::AwaitingConfirmation;
                return;
            }
            action.status = BuildActionStatus::Running;
            action.started = Some(Utc::now());
        }

        match action_type {
            BuildActionType::ReloadLibraryDependencies => {
                reload_library_dependencies::run(setup, this).await
            }
            BuildActionType::MovePackages => repo_management::run_move_packages(setup, this).await,
            BuildActionType::RemovePackages => {
                repo_management::run_remove_packages(setup, this).await
            }
            BuildActionType::CheckForProblems => {
                repo_management::run_check_for_problems(setup, this).await
            }
            BuildActionType::CleanRepository => {
                repo_management::run_clean_repository(setup, this).await
            }
            BuildActionType::PrepareBuild => prepare_build::run(setup, this).await,
            BuildActionType::ConductBuild => conduct_build::run(setup, this).await,
            BuildActionType::CustomCommand => custom_command::run(setup, this).await,
            BuildActionType::ReloadDatabase => misc::run_reload_database(setup, this).await,
            BuildActionType::CheckForUpdates => misc::run_check_for_updates(setup, this).await,
            BuildActionType::MakeLicenseInfo => misc::run_make_license_info(setup, this).await,
            BuildActionType::DummyBuildAction => misc::run_dummy(setup, this).await,
            BuildActionType::Invalid => {
                this.report_error(setup, "cannot start invalid build action").await
            }
        }
    }

    /// Resolve an awaiting confirmation; declining finishes the action
    pub async fn confirm(self: Arc<Self>, setup: &Arc<ServiceSetup>, approve: bool) {
        let awaiting = self.lock().status == BuildActionStatus::AwaitingConfirmation;
        if !awaiting {
            return;
        }
        if !approve {
            self.finish(
                setup,
                BuildActionResult::ConfirmationDeclined,
                BuildActionResultData::None,
            )
            .await;
            return;
        }
        self.confirmed.store(true, Ordering::Relaxed);
        Box::pin(self.start(setup)).await;
    }

    /// Validate flags and settings against the type's meta info
    fn validate_against_meta(&self, action_type: BuildActionType) -> Option<String> {
        let meta = build_action_meta();
        let type_info = meta.type_info_for_id(action_type)?;
        let action = self.lock();

        let declared_flags = type_info
            .flags
            .iter()
            .fold(0u64, |bits, flag| bits | flag.id);
        if action.flags & !declared_flags != 0 {
            return Some(format!(
                "flags {:#x} not declared for action type \"{}\"",
                action.flags & !declared_flags,
                type_info.type_slug
            ));
        }
        for key in action.settings.keys() {
            if !type_info.settings.iter().any(|s| s.param == key.as_str()) {
                return Some(format!(
                    "setting \"{}\" not declared for action type \"{}\"",
                    key, type_info.type_slug
                ));
            }
        }
        if !type_info.package_names && !action.package_names.is_empty() {
            return Some(format!(
                "action type \"{}\" does not take package names",
                type_info.type_slug
            ));
        }
        None
    }
}

/// The paths and tool locations the building subsystem works with, plus
/// the action history
pub struct BuildingConfig {
    /// `<working_dir>/building`
    pub working_directory: PathBuf,
    pub package_cache_dir: PathBuf,
    pub makepkg_path: PathBuf,
    pub makechrootpkg_path: PathBuf,
    pub updpkgsums_path: PathBuf,
    pub repo_add_path: PathBuf,
    pub repo_remove_path: PathBuf,
    pub chroot_dir: PathBuf,
    pub chroot_user: String,
    pub pkgbuilds_dirs: Vec<PathBuf>,
    pub actions: HashMap<u64, Arc<ActionHandle>>,
    pub next_action_id: u64,
}

impl Default for BuildingConfig {
    fn default() -> Self {
        Self {
            working_directory: PathBuf::from("building"),
            package_cache_dir: PathBuf::from("cache"),
            makepkg_path: PathBuf::from("makepkg"),
            makechrootpkg_path: PathBuf::from("makechrootpkg"),
            updpkgsums_path: PathBuf::from("updpkgsums"),
            repo_add_path: PathBuf::from("repo-add"),
            repo_remove_path: PathBuf::from("repo-remove"),
            chroot_dir: PathBuf::new(),
            chroot_user: "buildservice".to_string(),
            pkgbuilds_dirs: Vec::new(),
            actions: HashMap::new(),
            next_action_id: 0,
        }
    }
}

impl BuildingConfig {
    pub fn build_data_dir(&self) -> PathBuf {
        self.working_directory.join("build-data")
    }

    pub fn repo_management_dir(&self) -> PathBuf {
        self.working_directory.join("repo-management")
    }

    pub fn custom_command_dir(&self) -> PathBuf {
        self.working_directory.join("custom-commands")
    }

    pub fn action(&self, id: u64) -> Option<&Arc<ActionHandle>> {
        self.actions.get(&id)
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }
}

/// One package download requested from the external HTTP cache
#[derive(Debug, Clone)]
pub struct PackageCachingRequest {
    pub database: String,
    pub package: String,
    pub url: String,
    pub destination: PathBuf,
    /// Filled by the cacher on failure
    pub error: String,
}

/// Seam for the external HTTP client caching missing binary packages
///
/// Invoked outside any lock; implementations fill each request's `error`
/// on failure and leave it empty after a successful download to
/// `destination`.
pub trait PackageCacher: Send + Sync {
    fn cache_packages(&self, requests: &mut [PackageCachingRequest]);
}

/// The service state every action operates on
///
/// Lock acquisition order is always `config` before `building` when both
/// are needed; no action holds either lock across a subprocess or I/O
/// wait.
pub struct ServiceSetup {
    pub config: RwLock<Config>,
    pub building: RwLock<BuildingConfig>,
    /// Optional persistent backing for package data
    pub storage: Option<Arc<StorageEnvironment>>,
    /// Optional external download collaborator
    pub package_cacher: Option<Arc<dyn PackageCacher>>,
}

impl ServiceSetup {
    pub fn new(config: Config, building: BuildingConfig) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            building: RwLock::new(building),
            storage: None,
            package_cacher: None,
        })
    }

    pub fn with_storage(
        config: Config,
        building: BuildingConfig,
        storage: Arc<StorageEnvironment>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            building: RwLock::new(building),
            storage: Some(storage),
            package_cacher: None,
        })
    }

    /// Create a new action, assign its id and retain it in the history
    pub async fn create_action(&self, action_type: BuildActionType) -> Arc<ActionHandle> {
        let mut building = self.building.write().await;
        let id = building.next_action_id;
        building.next_action_id += 1;
        let handle = ActionHandle::new(id, action_type);
        building.actions.insert(id, Arc::clone(&handle));
        handle
    }
}

/// Resolve an action's destination databases under the config read lock
///
/// An empty denotation list yields an empty vector; callers decide
/// whether that means "all" or is an error.
pub fn resolve_database_denotations(
    config: &Config,
    denotations: &[String],
) -> Result<Vec<DatabaseId>, String> {
    let mut ids = Vec::with_capacity(denotations.len());
    for denotation in denotations {
        let (name, arch) = Config::parse_database_denotation(denotation);
        match config.find_database(name, arch) {
            Some(id) => ids.push(id),
            None => return Err(format!("database \"{}\" not found", denotation)),
        }
    }
    Ok(ids)
}

/// Default action directory: `<type-slug>-<iso-utc>-<dest-db-stem>`
pub fn default_action_directory(type_slug: &str, destination_db: &str) -> String {
    let timestamp = Utc::now().format("%Y-%m-%d-%H-%M-%S");
    let stem = destination_db
        .split('/')
        .next_back()
        .unwrap_or(destination_db)
        .trim_end_matches(".tar.zst")
        .trim_end_matches(".tar.xz")
        .trim_end_matches(".db");
    format!("{}-{}-{}", type_slug, timestamp, stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_setup() -> Arc<ServiceSetup> {
        ServiceSetup::new(Config::new(), BuildingConfig::default())
    }

    #[tokio::test]
    async fn test_action_lifecycle_success() {
        let setup = test_setup();
        let action = setup.create_action(BuildActionType::DummyBuildAction).await;
        assert_eq!(action.lock().status, BuildActionStatus::Created);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut tx = Some(tx);
        action.set_conclude_handler(Box::new(move || {
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
        }));

        action.clone().start(&setup).await;
        rx.await.unwrap();

        let data = action.lock();
        assert_eq!(data.status, BuildActionStatus::Finished);
        assert_eq!(data.result, BuildActionResult::Success);
        assert!(data.finished.is_some());
    }

    #[tokio::test]
    async fn test_aborted_action_reports_aborted() {
        let setup = test_setup();
        let action = setup.create_action(BuildActionType::DummyBuildAction).await;
        action.abort();
        action.clone().start(&setup).await;

        let data = action.lock();
        assert_eq!(data.status, BuildActionStatus::Finished);
        assert_eq!(data.result, BuildActionResult::Aborted);
    }

    #[tokio::test]
    async fn test_confirmation_flow() {
        let setup = test_setup();
        let action = setup.create_action(BuildActionType::DummyBuildAction).await;
        action.lock().requires_confirmation = true;

        action.clone().start(&setup).await;
        assert_eq!(action.lock().status, BuildActionStatus::AwaitingConfirmation);

        action.clone().confirm(&setup, true).await;
        let data = action.lock();
        assert_eq!(data.status, BuildActionStatus::Finished);
        assert_eq!(data.result, BuildActionResult::Success);
    }

    #[tokio::test]
    async fn test_confirmation_declined() {
        let setup = test_setup();
        let action = setup.create_action(BuildActionType::DummyBuildAction).await;
        action.lock().requires_confirmation = true;

        action.clone().start(&setup).await;
        action.clone().confirm(&setup, false).await;

        let data = action.lock();
        assert_eq!(data.status, BuildActionStatus::Finished);
        assert_eq!(data.result, BuildActionResult::ConfirmationDeclined);
    }

    #[tokio::test]
    async fn test_undeclared_flag_rejected() {
        let setup = test_setup();
        let action = setup.create_action(BuildActionType::ReloadDatabase).await;
        action.lock().flags = 0x80;
        action.clone().start(&setup).await;

        let data = action.lock();
        assert_eq!(data.result, BuildActionResult::Failure);
        match &data.result_data {
            BuildActionResultData::Error(message) => assert!(message.contains("flags")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undeclared_setting_rejected() {
        let setup = test_setup();
        let action = setup.create_action(BuildActionType::CustomCommand).await;
        action
            .lock()
            .settings
            .insert("no-such-setting".to_string(), "value".to_string());
        action.clone().start(&setup).await;

        assert_eq!(action.lock().result, BuildActionResult::Failure);
    }

    #[tokio::test]
    async fn test_action_ids_are_sequential_and_retained() {
        let setup = test_setup();
        let first = setup.create_action(BuildActionType::DummyBuildAction).await;
        let second = setup.create_action(BuildActionType::DummyBuildAction).await;
        assert_eq!(first.lock().id, 0);
        assert_eq!(second.lock().id, 1);

        let building = setup.building.read().await;
        assert_eq!(building.action_count(), 2);
        assert!(building.action(0).is_some());
    }

    #[test]
    fn test_default_action_directory_format() {
        let directory = default_action_directory("repo-move", "stable.db");
        assert!(directory.starts_with("repo-move-"));
        assert!(directory.ends_with("-stable"));
    }

    #[test]
    fn test_resolve_database_denotations() {
        let mut config = Config::new();
        config
            .databases
            .push(crate::database::Database::new("core", "core.db"));
        assert_eq!(
            resolve_database_denotations(&config, &["core@x86_64".to_string()]),
            Ok(vec![0])
        );
        assert!(resolve_database_denotations(&config, &["nope".to_string()]).is_err());
    }
}
