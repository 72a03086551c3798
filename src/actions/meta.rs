// src/actions/meta.rs

//! Static meta info describing every build-action type
//!
//! The table drives parameter validation at action start and lets the
//! outer layers enumerate available actions, their flags and settings
//! without hard-coding them.

use crate::actions::BuildActionType;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;

/// One flag an action type understands
#[derive(Debug, Clone, Serialize)]
pub struct BuildActionFlagMetaInfo {
    pub id: u64,
    pub name: &'static str,
    pub desc: &'static str,
    pub param: &'static str,
}

/// One free-form setting an action type understands
#[derive(Debug, Clone, Serialize)]
pub struct BuildActionSettingMetaInfo {
    pub name: &'static str,
    pub desc: &'static str,
    pub param: &'static str,
}

/// Meta info of one action type
#[derive(Debug, Clone, Serialize)]
pub struct BuildActionTypeMetaInfo {
    #[serde(skip)]
    pub id: BuildActionType,
    pub category: &'static str,
    pub name: &'static str,
    pub type_slug: &'static str,
    pub flags: Vec<BuildActionFlagMetaInfo>,
    pub settings: Vec<BuildActionSettingMetaInfo>,
    pub directory: bool,
    pub source_db: bool,
    pub destination_db: bool,
    pub package_names: bool,
}

/// The whole meta-info table plus lookup maps
pub struct BuildActionMetaInfo {
    pub types: Vec<BuildActionTypeMetaInfo>,
    by_slug: HashMap<&'static str, usize>,
}

impl BuildActionMetaInfo {
    pub fn type_info_for_id(&self, id: BuildActionType) -> Option<&BuildActionTypeMetaInfo> {
        self.types.iter().find(|info| info.id == id)
    }

    pub fn type_info_for_slug(&self, slug: &str) -> Option<&BuildActionTypeMetaInfo> {
        self.by_slug.get(slug).map(|&index| &self.types[index])
    }
}

/// Flags of the reload-library-dependencies action
pub mod reload_flags {
    pub const FORCE_RELOAD: u64 = 0x1;
    pub const SKIP_DEPENDENCIES: u64 = 0x2;
}

/// Flags of the prepare-build action
pub mod prepare_flags {
    pub const FORCE_BUMP_PKGREL: u64 = 0x1;
    pub const CLEAN_SRC_DIR: u64 = 0x2;
    pub const KEEP_ORDER: u64 = 0x4;
    pub const KEEP_PKGREL_AND_EPOCH: u64 = 0x8;
}

/// Flags of the conduct-build action
pub mod conduct_flags {
    pub const BUILD_AS_FAR_AS_POSSIBLE: u64 = 0x1;
    pub const SAVE_CHROOT_OF_FAILURES: u64 = 0x2;
    pub const UPDATE_CHECKSUMS: u64 = 0x4;
    pub const AUTO_STAGING: u64 = 0x8;
}

/// Flags of the clean-repository action
pub mod clean_flags {
    pub const DRY_RUN: u64 = 0x1;
}

/// Setting slugs referenced by the actions
pub mod settings {
    pub const PKGBUILDS_DIRS: &str = "pkgbuilds-dir";
    pub const CHROOT_DIR: &str = "chroot-dir";
    pub const CHROOT_USER: &str = "chroot-user";
    pub const PKG_CACHE_DIR: &str = "pkg-cache-dir";
    pub const COMMAND: &str = "cmd";
}

/// The process-wide meta-info table
pub fn build_action_meta() -> &'static BuildActionMetaInfo {
    static META: OnceLock<BuildActionMetaInfo> = OnceLock::new();
    META.get_or_init(|| {
        let types = vec![
            BuildActionTypeMetaInfo {
                id: BuildActionType::Invalid,
                category: "",
                name: "Invalid",
                type_slug: "invalid",
                flags: vec![],
                settings: vec![],
                directory: false,
                source_db: false,
                destination_db: false,
                package_names: false,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::RemovePackages,
                category: "Repo management",
                name: "Remove packages",
                type_slug: "remove-packages",
                flags: vec![],
                settings: vec![],
                directory: true,
                source_db: false,
                destination_db: true,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::MovePackages,
                category: "Repo management",
                name: "Move packages",
                type_slug: "move-packages",
                flags: vec![],
                settings: vec![],
                directory: true,
                source_db: true,
                destination_db: true,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::CheckForUpdates,
                category: "Repo management",
                name: "Check for updates",
                type_slug: "check-updates",
                flags: vec![],
                settings: vec![],
                directory: false,
                source_db: true,
                destination_db: true,
                package_names: false,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::ReloadDatabase,
                category: "Repo management",
                name: "Reload databases",
                type_slug: "reload-database",
                flags: vec![],
                settings: vec![],
                directory: false,
                source_db: false,
                destination_db: true,
                package_names: false,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::ReloadLibraryDependencies,
                category: "Refresh data",
                name: "Reload library dependencies",
                type_slug: "reload-library-dependencies",
                flags: vec![
                    BuildActionFlagMetaInfo {
                        id: reload_flags::FORCE_RELOAD,
                        name: "Force reload",
                        desc: "Reload packages even though they have not changed on disk since the last reload",
                        param: "force-reload",
                    },
                    BuildActionFlagMetaInfo {
                        id: reload_flags::SKIP_DEPENDENCIES,
                        name: "Skip dependencies",
                        desc: "Do not take dependencies of the specified destination databases into account",
                        param: "skip-dependencies",
                    },
                ],
                settings: vec![],
                directory: false,
                source_db: false,
                destination_db: true,
                package_names: false,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::PrepareBuild,
                category: "Building",
                name: "Prepare build",
                type_slug: "prepare-build",
                flags: vec![
                    BuildActionFlagMetaInfo {
                        id: prepare_flags::FORCE_BUMP_PKGREL,
                        name: "Force-bump pkgrel",
                        desc: "Bump the pkgrel even if there is no existing version",
                        param: "force-bump-pkgrel",
                    },
                    BuildActionFlagMetaInfo {
                        id: prepare_flags::CLEAN_SRC_DIR,
                        name: "Clean source directory",
                        desc: "Removes existing \"src\" sub-directories for the specified packages",
                        param: "clean-src-dir",
                    },
                    BuildActionFlagMetaInfo {
                        id: prepare_flags::KEEP_ORDER,
                        name: "Keep dependency order",
                        desc: "Build packages in the specified order",
                        param: "keep-order",
                    },
                    BuildActionFlagMetaInfo {
                        id: prepare_flags::KEEP_PKGREL_AND_EPOCH,
                        name: "Keep pkgrel/epoch",
                        desc: "Never bumps pkgrel and epoch",
                        param: "keep-pkgrel-and-epoch",
                    },
                ],
                settings: vec![BuildActionSettingMetaInfo {
                    name: "PKGBUILDs directory",
                    desc: "A colon separated list of PKGBUILD directories to consider before the standard directories",
                    param: settings::PKGBUILDS_DIRS,
                }],
                directory: true,
                source_db: true,
                destination_db: true,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::ConductBuild,
                category: "Building",
                name: "Conduct build",
                type_slug: "conduct-build",
                flags: vec![
                    BuildActionFlagMetaInfo {
                        id: conduct_flags::BUILD_AS_FAR_AS_POSSIBLE,
                        name: "Build as far as possible",
                        desc: "Continue with the next batch even when packages of the previous batch failed",
                        param: "build-as-far-as-possible",
                    },
                    BuildActionFlagMetaInfo {
                        id: conduct_flags::SAVE_CHROOT_OF_FAILURES,
                        name: "Save chroot of failures",
                        desc: "Renames the chroot working copy when a package fails to build",
                        param: "save-chroot-of-failures",
                    },
                    BuildActionFlagMetaInfo {
                        id: conduct_flags::UPDATE_CHECKSUMS,
                        name: "Update checksums",
                        desc: "Updates the checksums of the PKGBUILDs instead of using them for validation",
                        param: "update-checksums",
                    },
                    BuildActionFlagMetaInfo {
                        id: conduct_flags::AUTO_STAGING,
                        name: "Auto-staging",
                        desc: "Adds breaking packages only to the staging repository and emits a rebuild list",
                        param: "auto-staging",
                    },
                ],
                settings: vec![
                    BuildActionSettingMetaInfo {
                        name: "Chroot directory",
                        desc: "The chroot directory to use instead of the globally configured one",
                        param: settings::CHROOT_DIR,
                    },
                    BuildActionSettingMetaInfo {
                        name: "Chroot default user",
                        desc: "The chroot user to use instead of the globally configured one",
                        param: settings::CHROOT_USER,
                    },
                    BuildActionSettingMetaInfo {
                        name: "Package cache directory",
                        desc: "The package cache directory to use instead of the globally configured one",
                        param: settings::PKG_CACHE_DIR,
                    },
                ],
                directory: true,
                source_db: false,
                destination_db: false,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::MakeLicenseInfo,
                category: "Misc",
                name: "Make license info",
                type_slug: "make-license-info",
                flags: vec![],
                settings: vec![],
                directory: false,
                source_db: false,
                destination_db: false,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::CheckForProblems,
                category: "Repo management",
                name: "Check for problems",
                type_slug: "check-for-problems",
                flags: vec![],
                settings: vec![],
                directory: true,
                source_db: false,
                destination_db: true,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::CleanRepository,
                category: "Repo management",
                name: "Clean repository",
                type_slug: "clean-repository",
                flags: vec![BuildActionFlagMetaInfo {
                    id: clean_flags::DRY_RUN,
                    name: "Dry run",
                    desc: "Only record what would be done",
                    param: "dry-run",
                }],
                settings: vec![],
                directory: true,
                source_db: false,
                destination_db: true,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::DummyBuildAction,
                category: "Misc",
                name: "Dummy action for debugging",
                type_slug: "dummy",
                flags: vec![],
                settings: vec![],
                directory: true,
                source_db: false,
                destination_db: false,
                package_names: false,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::CustomCommand,
                category: "Misc",
                name: "Execute custom Bash command",
                type_slug: "custom-command",
                flags: vec![],
                settings: vec![BuildActionSettingMetaInfo {
                    name: "Command",
                    desc: "The command to execute via Bash",
                    param: settings::COMMAND,
                }],
                directory: true,
                source_db: false,
                destination_db: false,
                package_names: false,
            },
        ];
        let by_slug = types
            .iter()
            .enumerate()
            .map(|(index, info)| (info.type_slug, index))
            .collect();
        BuildActionMetaInfo { types, by_slug }
    })
}
