use minijinja::Environment;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf};

#[derive(Debug, serde::Deserialize, Clone)]
#[serde(tag = "source", rename_all = "snake_case")]
enum Lookup {
    Env { name: String },
}

#[derive(Debug, serde::Deserialize, Clone)]
#[serde(untagged)]
enum BerthVarEntry {
    Raw(String),
    Lookup(Lookup),
}

#[derive(Debug, Default, Clone)]
pub struct BerthVars {
    inner: HashMap<String, BerthVarEntry>,
}

impl<'de> Deserialize<'de> for BerthVars {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let inner = HashMap::deserialize(deserializer)?;
        Ok(Self { inner })
    }
}

impl BerthVars {
    pub fn materialize(self) -> BerthVarsMaterialized {
        let mut inner = HashMap::new();
        for (key, entry) in self.inner {
            match entry {
                BerthVarEntry::Raw(s) => {
                    inner.insert(key, s);
                }
                BerthVarEntry::Lookup(Lookup::Env { name }) => match std::env::var(&name) {
                    Ok(value) => {
                        inner.insert(key, value);
                    }
                    // Leaving the key out makes strict rendering fail with
                    // an undefined-variable error naming the var.
                    Err(e) => log::warn!("Unable to read env var {name} for {key}: {e}"),
                },
            }
        }
        BerthVarsMaterialized { inner }
    }
}

#[derive(Debug, Default, Clone)]
pub struct BerthVarsMaterialized {
    inner: HashMap<String, String>,
}

impl BerthVarsMaterialized {
    pub fn try_init() -> Result<Self, VarsError> {
        let vars_raw = BerthVars::try_init()?;
        Ok(vars_raw.materialize())
    }
}

impl Serialize for BerthVarsMaterialized {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.inner.serialize(serializer)
    }
}

/// Files that match berth.vars | *.berth.vars
/// Sorted
fn list_vars_files() -> Vec<PathBuf> {
    let mut files = Vec::new();
    let cli_args = crate::cli::get_cli_args();

    let search_dir = cli_args.config.parent().map_or(Path::new("."), |p| {
        if p.as_os_str().is_empty() {
            Path::new(".")
        } else {
            p
        }
    });
    if let Ok(entries) = std::fs::read_dir(search_dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_file() {
                if let Some(file_name) = path.file_name().and_then(|s| s.to_str()) {
                    if file_name == "berth.vars" || file_name.ends_with(".berth.vars") {
                        files.push(path);
                    }
                }
            }
        }
    }

    files.sort(); // Sort the paths alphabetically
    files
}

impl BerthVars {
    fn try_init_from_string(val: &str) -> Result<Self, VarsError> {
        Ok(toml::from_str(val)?)
    }

    fn combine(vars: Vec<Self>) -> Self {
        let mut combined_inner = HashMap::new();
        vars.into_iter().for_each(|var_set| {
            combined_inner.extend(var_set.inner);
        });
        Self {
            inner: combined_inner,
        }
    }

    fn try_init() -> Result<Self, VarsError> {
        use std::io::Read;
        let mut vars = Vec::new();
        let vars_files = list_vars_files();
        for vars_file in vars_files {
            match std::fs::File::open(vars_file) {
                Ok(mut file) => {
                    let mut this_vars = String::new();
                    file.read_to_string(&mut this_vars)?;
                    match Self::try_init_from_string(&this_vars) {
                        Ok(this_vars) => vars.push(this_vars),
                        Err(e) => log::error!("Error parsing vars file: {e}"),
                    }
                }
                Err(e) => log::error!("Error reading vars file: {e}"),
            }
        }

        Ok(Self::combine(vars))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VarsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub fn render_template(
    template_str: &str,
    vars: &BerthVarsMaterialized,
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();

    let syntax = minijinja::syntax::SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .build()
        .expect("This really should not fail. If this fail something has gone horribly wrong.");

    env.set_syntax(syntax);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

    let template = env.template_from_str(template_str)?;
    Ok(template.render(vars)?)
}
