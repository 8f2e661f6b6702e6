use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::engine::{error::RuleError, models::Phase};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_bytes: u64,
    pub max_processes: u64,
    pub max_output_bytes: u64,
    pub allow_network: bool,
}

impl Limits {
    fn first_non_positive(&self) -> Option<&'static str> {
        [
            ("cpu_time_ms", self.cpu_time_ms),
            ("wall_time_ms", self.wall_time_ms),
            ("memory_bytes", self.memory_bytes),
            ("max_processes", self.max_processes),
            ("max_output_bytes", self.max_output_bytes),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0)
        .map(|(field, _)| field)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Mount {
    pub source: PathBuf,
    #[serde(default)]
    pub target: Option<PathBuf>,
}

impl Mount {
    pub fn target(&self) -> &Path {
        self.target.as_deref().unwrap_or(&self.source)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub language: String,
    #[serde(default)]
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    pub limits: Limits,
    #[serde(default)]
    pub filesystem_view: Vec<Mount>,
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_workdir() -> PathBuf {
    PathBuf::from("/workspace")
}

impl Rule {
    pub fn command(&self, phase: Phase) -> Option<&[String]> {
        match phase {
            Phase::Compile => self.compile_command.as_deref(),
            Phase::Run => Some(self.run_command.as_slice()),
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compile_command.is_some()
    }

    fn validate(&self, index: usize) -> Result<(), RuleError> {
        if self.language.trim().is_empty() {
            return Err(RuleError::EmptyLanguage { index });
        }
        if self.run_command.is_empty() || self.run_command[0].trim().is_empty() {
            return Err(RuleError::EmptyRunCommand(self.language.clone()));
        }
        if let Some(compile) = &self.compile_command
            && (compile.is_empty() || compile[0].trim().is_empty())
        {
            return Err(RuleError::EmptyCompileCommand(self.language.clone()));
        }
        if let Some(field) = self.limits.first_non_positive() {
            return Err(RuleError::NonPositiveLimit {
                language: self.language.clone(),
                field,
            });
        }
        if !self.workdir.is_absolute() {
            return Err(RuleError::RelativeSandboxPath {
                language: self.language.clone(),
                path: self.workdir.clone(),
            });
        }
        for mount in &self.filesystem_view {
            for path in [mount.source.as_path(), mount.target()] {
                if !path.is_absolute() {
                    return Err(RuleError::RelativeSandboxPath {
                        language: self.language.clone(),
                        path: path.to_path_buf(),
                    });
                }
            }
            if !mount.source.exists() {
                return Err(RuleError::MissingMountSource {
                    language: self.language.clone(),
                    path: mount.source.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDocument {
    rules: Vec<Rule>,
}

/// Validated, immutable language table. Built completely before it is handed
/// out, so a partially valid document is never observable.
#[derive(Debug)]
pub struct RuleSet {
    rules: HashMap<String, Arc<Rule>>,
    order: Vec<String>,
}

impl RuleSet {
    pub fn load(document: &str) -> Result<Self, RuleError> {
        let document: PolicyDocument = serde_json::from_str(document)?;
        Self::from_rules(document.rules)
    }

    pub fn load_file(path: &Path) -> Result<Self, RuleError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load(&raw)
    }

    pub fn from_rules(rules: Vec<Rule>) -> Result<Self, RuleError> {
        if rules.is_empty() {
            return Err(RuleError::Empty);
        }
        let mut table = HashMap::with_capacity(rules.len());
        let mut order = Vec::with_capacity(rules.len());
        for (index, rule) in rules.into_iter().enumerate() {
            rule.validate(index)?;
            if table.contains_key(&rule.language) {
                return Err(RuleError::DuplicateLanguage(rule.language));
            }
            order.push(rule.language.clone());
            table.insert(rule.language.clone(), Arc::new(rule));
        }
        Ok(Self {
            rules: table,
            order,
        })
    }

    pub fn lookup(&self, language: &str) -> Result<Arc<Rule>, RuleError> {
        self.rules
            .get(language)
            .cloned()
            .ok_or_else(|| RuleError::UnknownLanguage(language.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.order.iter().filter_map(|language| self.rules.get(language))
    }

}
