use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::schema::SchemaVersion;
use crate::step::MigrationStep;
use crate::versions;

/// Builds the steps of one version namespace, in execution order.
pub type StepFactory = fn() -> Vec<Box<dyn MigrationStep>>;

/// The steps that take a database to `version` from the version before it.
#[derive(Debug, Clone, Copy)]
pub struct Namespace {
    pub version: SchemaVersion,
    pub steps: StepFactory,
}

/// Every version namespace the engine knows about, ordered by version.
#[derive(Debug, Clone)]
pub struct Registry {
    namespaces: Vec<Namespace>,
}

impl Registry {
    /// Create a registry, validating that versions strictly increase and that step names are
    /// unique within each namespace.
    pub fn try_new(namespaces: Vec<Namespace>) -> Result<Self, String> {
        for (i, namespace) in namespaces.iter().enumerate() {
            if namespace.version == SchemaVersion::V2_0 {
                return Err("the 2.0 baseline cannot have migration steps".to_string());
            }
            if i > 0 && namespaces[i - 1].version >= namespace.version {
                return Err(format!(
                    "namespaces must be in increasing version order, found {} after {}",
                    namespace.version,
                    namespaces[i - 1].version
                ));
            }
            let mut names = HashSet::new();
            for step in (namespace.steps)() {
                let name = step.name();
                if !names.insert(name.clone()) {
                    return Err(format!(
                        "duplicate step '{}' in namespace {}",
                        name,
                        namespace.version.namespace()
                    ));
                }
            }
        }
        Ok(Self { namespaces })
    }

    /// The steps shipped with this crate.
    pub fn builtin() -> Self {
        Self {
            namespaces: vec![
                Namespace {
                    version: SchemaVersion::V2_1,
                    steps: versions::v2_1::steps,
                },
                Namespace {
                    version: SchemaVersion::V3_0,
                    steps: versions::v3_0::steps,
                },
            ],
        }
    }

    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    /// Concatenate the steps of every namespace after `from` up to and including `to`.
    pub fn plan(&self, from: SchemaVersion, to: SchemaVersion) -> MigrationPlan {
        let mut steps = Vec::new();
        for namespace in &self.namespaces {
            if namespace.version <= from || namespace.version > to {
                continue;
            }
            steps.extend(
                (namespace.steps)()
                    .into_iter()
                    .enumerate()
                    .map(|(index, step)| PlannedStep {
                        version: namespace.version,
                        index,
                        step,
                    }),
            );
        }
        MigrationPlan { from, to, steps }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// A step placed in a plan.
#[derive(Debug)]
pub struct PlannedStep {
    pub version: SchemaVersion,
    /// Position within its namespace.
    pub index: usize,
    pub step: Box<dyn MigrationStep>,
}

impl PlannedStep {
    /// Identifier recorded in the maintenance state, eg. `v2_1/Adding new tables`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.version.namespace(), self.step.name())
    }
}

/// The ordered steps between two versions.
#[derive(Debug)]
pub struct MigrationPlan {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    steps: Vec<PlannedStep>,
}

impl MigrationPlan {
    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn get(&self, position: usize) -> Option<&PlannedStep> {
        self.steps.get(position)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Checksum over the identity and order of every step. A run resumed with a different
    /// fingerprint would apply offsets to the wrong steps.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.from.namespace().as_bytes());
        hasher.update(b"|");
        hasher.update(self.to.namespace().as_bytes());
        for planned in &self.steps {
            hasher.update(b"\n");
            hasher.update(planned.version.namespace().as_bytes());
            hasher.update(b"|");
            hasher.update(planned.index.to_string().as_bytes());
            hasher.update(b"|");
            hasher.update(planned.step.name().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}
