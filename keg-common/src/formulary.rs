// keg-common/src/formulary.rs
// Recipe registry: owns every loaded recipe for the life of the process and
// resolves dependency references to filesystem prefixes.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use super::config::Config;
use super::dependency::Dependency;
use super::error::{KegError, Result};
use super::keg::KegRegistry;
use super::model::plan::ResolvedDependency;
use super::model::recipe::Recipe;

#[derive(Debug)]
pub struct Formulary {
    config: Config,
    kegs: KegRegistry,
    recipes: BTreeMap<String, Arc<Recipe>>,
}

impl Formulary {
    /// An empty registry; recipes are added with [`Formulary::insert`].
    pub fn new(config: Config) -> Self {
        Self {
            kegs: KegRegistry::new(config.clone()),
            config,
            recipes: BTreeMap::new(),
        }
    }

    /// Loads every `*.toml` and `*.json` recipe from `config.recipes_dir`.
    pub fn load(config: Config) -> Result<Self> {
        let dir = config.recipes_dir.clone();
        let mut formulary = Self::new(config);
        formulary.load_dir(&dir)?;
        Ok(formulary)
    }

    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            return Err(KegError::NotFound(format!(
                "Recipe directory {} does not exist",
                dir.display()
            )));
        }
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(p.extension().and_then(|e| e.to_str()), Some("toml" | "json"))
            })
            .collect();
        paths.sort();

        for path in &paths {
            self.insert(Recipe::from_path(path)?)?;
        }
        info!("Loaded {} recipes from {}", paths.len(), dir.display());
        Ok(paths.len())
    }

    pub fn insert(&mut self, recipe: Recipe) -> Result<Arc<Recipe>> {
        recipe.validate()?;
        if self.recipes.contains_key(&recipe.name) {
            return Err(KegError::Configuration(format!(
                "Recipe '{}' is defined more than once",
                recipe.name
            )));
        }
        debug!("Registered recipe '{}' {}", recipe.name, recipe.version);
        let recipe = Arc::new(recipe);
        self.recipes.insert(recipe.name.clone(), Arc::clone(&recipe));
        Ok(recipe)
    }

    pub fn insert_toml(&mut self, raw: &str) -> Result<Arc<Recipe>> {
        self.insert(Recipe::from_toml_str(raw)?)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Recipe>> {
        self.recipes
            .get(name)
            .cloned()
            .ok_or_else(|| KegError::NotFound(format!("Recipe '{name}' not found")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.recipes.contains_key(name)
    }

    /// Recipe names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.recipes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn kegs(&self) -> &KegRegistry {
        &self.kegs
    }

    /// Maps a dependency reference to the prefix a build should use.
    /// System references resolve to the configured system prefix; anything
    /// else must be a known recipe with an installed keg.
    pub fn resolve_dependency(&self, dep: &Dependency) -> Result<ResolvedDependency> {
        if dep.is_system() {
            return Ok(ResolvedDependency {
                name: dep.name.clone(),
                tags: dep.tags,
                prefix: self.config.system_prefix.clone(),
            });
        }
        if !self.contains(&dep.name) {
            return Err(KegError::Configuration(format!(
                "Dependency '{}' ({}) is not a known recipe",
                dep.name, dep.tags
            )));
        }
        match self.kegs.get_installed_keg(&dep.name)? {
            Some(keg) => Ok(ResolvedDependency {
                name: dep.name.clone(),
                tags: dep.tags,
                prefix: keg.path,
            }),
            None => Err(KegError::Configuration(format!(
                "Dependency '{}' ({}) is not installed under {}",
                dep.name,
                dep.tags,
                self.kegs.cellar_path().display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::DependencyTag;

    const SHA: &str = "e4ec9a37bc96adb6a29e88dbef1b2dbe43e0b4014e91450d6b95ec7d238cdddb";

    fn recipe_toml(name: &str) -> String {
        format!(
            "name = \"{name}\"\nversion = \"1.0\"\n[[source]]\nurl = \"file:///src/{name}.tar.gz\"\nsha256 = \"{SHA}\"\n"
        )
    }

    #[test]
    fn loads_directory_and_rejects_duplicates() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        fs::create_dir_all(&config.recipes_dir).unwrap();
        fs::write(config.recipes_dir.join("gmp.toml"), recipe_toml("gmp")).unwrap();
        fs::write(config.recipes_dir.join("README.md"), "ignored").unwrap();

        let mut formulary = Formulary::load(config).unwrap();
        assert_eq!(formulary.names().collect::<Vec<_>>(), ["gmp"]);
        assert!(formulary.get("mpfr").is_err());
        let err = formulary.insert_toml(&recipe_toml("gmp")).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn resolves_dependencies_by_mode() {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(root.path());
        config.system_prefix = root.path().join("usr");
        fs::create_dir_all(config.keg_path("gmp", "1.0")).unwrap();
        let mut formulary = Formulary::new(config.clone());
        formulary.insert_toml(&recipe_toml("gmp")).unwrap();
        formulary.insert_toml(&recipe_toml("mpfr")).unwrap();

        let gmp = formulary.resolve_dependency(&Dependency::new_runtime("gmp")).unwrap();
        assert_eq!(gmp.prefix, config.keg_path("gmp", "1.0"));

        let zlib = Dependency::new_with_tags("zlib", DependencyTag::SYSTEM);
        assert_eq!(formulary.resolve_dependency(&zlib).unwrap().prefix, root.path().join("usr"));

        // Known but not installed.
        let err = formulary.resolve_dependency(&Dependency::new_runtime("mpfr")).unwrap_err();
        assert!(err.is_configuration());
        // Unknown.
        let err = formulary.resolve_dependency(&Dependency::new_runtime("isl")).unwrap_err();
        assert!(err.is_configuration());
    }
}
