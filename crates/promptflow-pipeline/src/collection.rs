//! Pipeline collections: compiled pipelines keyed by URL.
//!
//! [`SimplePipelineCollection`] owns its pipelines. A [`Subcollection`] is a
//! live filtered view over another collection; it evaluates its predicate on
//! every access and never copies.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use promptflow_markdown::slugify;
use promptflow_types::{PromptflowError, Result};

use crate::compiler::compile_pipeline;
use crate::pipeline::CompiledPipeline;
use crate::registries::Registries;
use crate::validation::validate_or_raise;

/// Lookup key of a pipeline URL: trimmed, without fragment.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    url.split_once('#').map_or(url, |(base, _)| base).to_string()
}

/// Whether `pipeline` answers to `name`: its title, the slug of its title,
/// or the stem of its URL.
fn answers_to(pipeline: &CompiledPipeline, name: &str) -> bool {
    let name = name.trim();
    pipeline.title.eq_ignore_ascii_case(name)
        || slugify(&pipeline.title) == slugify(name)
        || pipeline.url_stem().is_some_and(|stem| stem == name)
}

// ---------------------------------------------------------------------------
// PipelineCollection trait
// ---------------------------------------------------------------------------

pub trait PipelineCollection: Send + Sync {
    /// Normalized URLs, sorted.
    fn list_pipelines(&self) -> Vec<String>;

    fn get_pipeline_by_url(&self, url: &str) -> Result<Arc<CompiledPipeline>>;

    /// Linear scan over titles and URL stems.
    fn get_pipeline_by_name(&self, name: &str) -> Result<Arc<CompiledPipeline>> {
        self.list_pipelines()
            .iter()
            .filter_map(|url| self.get_pipeline_by_url(url).ok())
            .find(|p| answers_to(p, name))
            .ok_or_else(|| PromptflowError::NotFound(format!("no pipeline named \"{name}\"")))
    }
}

// ---------------------------------------------------------------------------
// SimplePipelineCollection
// ---------------------------------------------------------------------------

/// Pipelines held in memory.
#[derive(Debug, Default)]
pub struct SimplePipelineCollection {
    pipelines: RwLock<BTreeMap<String, Arc<CompiledPipeline>>>,
    registries: Registries,
}

impl SimplePipelineCollection {
    pub fn new(registries: Registries) -> Self {
        Self {
            pipelines: RwLock::new(BTreeMap::new()),
            registries,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<CompiledPipeline>>> {
        self.pipelines.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate and add one pipeline. Its pipeline calls must resolve within
    /// the collection, counting the new pipeline itself.
    pub fn insert(&self, pipeline: CompiledPipeline) -> Result<()> {
        let url = pipeline_key(&pipeline)?;
        validate_or_raise(&pipeline, &self.registries)?;
        let mut pipelines = self.pipelines.write().unwrap_or_else(|e| e.into_inner());
        if pipelines.contains_key(&url) {
            return Err(PromptflowError::Collection(format!(
                "pipeline {url} is already in the collection"
            )));
        }
        let mut known: BTreeSet<&str> = pipelines.keys().map(String::as_str).collect();
        known.insert(&url);
        check_references(&pipeline, &known)?;
        tracing::debug!(url = %url, "Pipeline added to collection");
        pipelines.insert(url, Arc::new(pipeline));
        Ok(())
    }
}

fn pipeline_key(pipeline: &CompiledPipeline) -> Result<String> {
    match pipeline.url.as_deref().map(normalize_url) {
        Some(url) if !url.is_empty() => Ok(url),
        _ => Err(PromptflowError::Collection(format!(
            "pipeline \"{}\" has no URL and cannot be put in a collection",
            pipeline.title
        ))),
    }
}

fn check_references(pipeline: &CompiledPipeline, known: &BTreeSet<&str>) -> Result<()> {
    for task in &pipeline.tasks {
        if let Some(called) = task.called_pipeline_url() {
            let called = normalize_url(called);
            if !known.contains(called.as_str()) {
                return Err(PromptflowError::Reference(format!(
                    "task '{}' of \"{}\" calls {called}, which is not in the collection",
                    task.name, pipeline.title
                )));
            }
        }
    }
    Ok(())
}

impl PipelineCollection for SimplePipelineCollection {
    fn list_pipelines(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    fn get_pipeline_by_url(&self, url: &str) -> Result<Arc<CompiledPipeline>> {
        let key = normalize_url(url);
        self.read()
            .get(&key)
            .cloned()
            .ok_or_else(|| PromptflowError::NotFound(format!("no pipeline at {key}")))
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Build a collection from compiled pipelines. Every pipeline is validated
/// and every pipeline call resolved before anything becomes queryable; the
/// first problem fails the whole construction.
pub fn create_collection_from_json(
    pipelines: impl IntoIterator<Item = CompiledPipeline>,
    registries: &Registries,
) -> Result<SimplePipelineCollection> {
    let mut staged: BTreeMap<String, Arc<CompiledPipeline>> = BTreeMap::new();
    for pipeline in pipelines {
        let url = pipeline_key(&pipeline)?;
        validate_or_raise(&pipeline, registries)?;
        if staged.contains_key(&url) {
            return Err(PromptflowError::Collection(format!(
                "pipeline {url} appears more than once"
            )));
        }
        staged.insert(url, Arc::new(pipeline));
    }

    let known: BTreeSet<&str> = staged.keys().map(String::as_str).collect();
    for pipeline in staged.values() {
        check_references(pipeline, &known)?;
    }

    tracing::info!(pipelines = staged.len(), "Collection built");
    Ok(SimplePipelineCollection {
        pipelines: RwLock::new(staged),
        registries: registries.clone(),
    })
}

/// [`create_collection_from_json`] over a JSON array of pipelines.
pub fn create_collection_from_json_str(
    json: &str,
    registries: &Registries,
) -> Result<SimplePipelineCollection> {
    let pipelines: Vec<CompiledPipeline> = serde_json::from_str(json)
        .map_err(|e| PromptflowError::Collection(format!("invalid pipeline JSON: {e}")))?;
    create_collection_from_json(pipelines, registries)
}

/// Compile markdown sources and build a collection from them.
pub fn create_collection_from_markdown<'a>(
    sources: impl IntoIterator<Item = &'a str>,
    registries: &Registries,
) -> Result<SimplePipelineCollection> {
    let pipelines = sources
        .into_iter()
        .map(|source| compile_pipeline(source, registries))
        .collect::<Result<Vec<_>>>()?;
    create_collection_from_json(pipelines, registries)
}

/// Compile every `*.md` file directly inside `dir` into one collection.
pub fn create_collection_from_directory(
    dir: &Path,
    registries: &Registries,
) -> Result<SimplePipelineCollection> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
        .collect();
    paths.sort();

    let mut sources = Vec::with_capacity(paths.len());
    for path in &paths {
        let source = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Loading pipeline source");
        sources.push(source);
    }
    create_collection_from_markdown(sources.iter().map(String::as_str), registries)
}

/// Every pipeline of `collection`, in URL order.
pub fn collection_to_json(collection: &dyn PipelineCollection) -> Result<Vec<CompiledPipeline>> {
    collection
        .list_pipelines()
        .iter()
        .map(|url| collection.get_pipeline_by_url(url).map(|p| (*p).clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Subcollection
// ---------------------------------------------------------------------------

pub type UrlPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Filtered live view over a parent collection.
pub struct Subcollection {
    parent: Arc<dyn PipelineCollection>,
    predicate: UrlPredicate,
}

pub fn create_subcollection(
    parent: Arc<dyn PipelineCollection>,
    predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
) -> Subcollection {
    Subcollection {
        parent,
        predicate: Arc::new(predicate),
    }
}

impl PipelineCollection for Subcollection {
    fn list_pipelines(&self) -> Vec<String> {
        self.parent
            .list_pipelines()
            .into_iter()
            .filter(|url| (self.predicate)(url))
            .collect()
    }

    fn get_pipeline_by_url(&self, url: &str) -> Result<Arc<CompiledPipeline>> {
        let key = normalize_url(url);
        if !(self.predicate)(&key) {
            return Err(PromptflowError::NotFound(format!(
                "no pipeline at {key} in this subcollection"
            )));
        }
        self.parent.get_pipeline_by_url(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptflow_types::ErrorKind;
    use tempfile::TempDir;

    fn source(url: &str, title: &str) -> String {
        format!(
            "# {title}\n\n- PIPELINE URL {url}\n- INPUT PARAMETER {{x}}\n- OUTPUT PARAMETER {{y}}\n\n## Echo\n\n```\n{{x}}\n```\n\n-> {{y}}\n"
        )
    }

    fn caller(url: &str, callee: &str) -> String {
        format!(
            "# Caller\n\n- PIPELINE URL {url}\n- INPUT PARAMETER {{x}}\n- OUTPUT PARAMETER {{y}}\n\n## Call\n\n- BLOCK Pipeline\n\n```\n{callee}\n{{x}}\n```\n\n-> {{y}}\n"
        )
    }

    fn compiled(src: &str) -> CompiledPipeline {
        compile_pipeline(src, &Registries::standard()).unwrap()
    }

    #[test]
    fn lookup_by_url_and_name() {
        let collection = create_collection_from_markdown(
            [
                source("https://x.com/a.ptbk.md", "First One").as_str(),
                source("https://x.com/b.ptbk.md", "Second").as_str(),
            ],
            &Registries::standard(),
        )
        .unwrap();
        assert_eq!(
            collection.list_pipelines(),
            vec!["https://x.com/a.ptbk.md", "https://x.com/b.ptbk.md"]
        );
        let a = collection.get_pipeline_by_url(" https://x.com/a.ptbk.md#v2 ").unwrap();
        assert_eq!(a.title, "First One");
        assert_eq!(collection.get_pipeline_by_name("first-one").unwrap().title, "First One");
        assert_eq!(collection.get_pipeline_by_name("b").unwrap().title, "Second");

        let err = collection.get_pipeline_by_name("third").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = collection.get_pipeline_by_url("https://x.com/zzz").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn duplicate_and_missing_urls_fail() {
        let registries = Registries::standard();
        let a = compiled(&source("https://x.com/a", "A"));
        let err = create_collection_from_json([a.clone(), a], &registries).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Collection);

        let mut no_url = compiled(&source("https://x.com/a", "A"));
        no_url.url = None;
        let err = create_collection_from_json([no_url], &registries).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Collection);
    }

    #[test]
    fn unresolved_pipeline_call_is_reference_error() {
        let registries = Registries::standard();
        let caller = compiled(&caller("https://x.com/caller", "https://x.com/missing"));
        let err = create_collection_from_json([caller.clone()], &registries).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reference);

        let callee = compiled(&source("https://x.com/missing", "Callee"));
        let collection = create_collection_from_json([caller, callee], &registries).unwrap();
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn json_string_round_trip() {
        let registries = Registries::standard();
        let collection = create_collection_from_markdown(
            [source("https://x.com/a", "A").as_str()],
            &registries,
        )
        .unwrap();
        let json = serde_json::to_string(&collection_to_json(&collection).unwrap()).unwrap();
        let rebuilt = create_collection_from_json_str(&json, &registries).unwrap();
        assert_eq!(rebuilt.list_pipelines(), collection.list_pipelines());

        let err = create_collection_from_json_str("{not json", &registries).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Collection);
    }

    #[test]
    fn insert_validates_and_rejects_duplicates() {
        let collection = SimplePipelineCollection::new(Registries::standard());
        assert!(collection.is_empty());
        collection.insert(compiled(&source("https://x.com/a", "A"))).unwrap();
        let err = collection
            .insert(compiled(&source("https://x.com/a#other", "A again")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Collection);
        let err = collection
            .insert(compiled(&caller("https://x.com/c", "https://x.com/nope")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reference);
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn subcollection_filters_per_access() {
        let parent = Arc::new(SimplePipelineCollection::new(Registries::standard()));
        parent.insert(compiled(&source("https://x.com/public/a", "A"))).unwrap();
        parent.insert(compiled(&source("https://x.com/private/b", "B"))).unwrap();

        let view = create_subcollection(parent.clone(), |url| url.contains("/public/"));
        assert_eq!(view.list_pipelines(), vec!["https://x.com/public/a"]);
        assert!(view.get_pipeline_by_url("https://x.com/private/b").is_err());
        assert!(view.get_pipeline_by_name("B").is_err());
        assert_eq!(view.get_pipeline_by_name("A").unwrap().title, "A");
    }

    #[test]
    fn loads_markdown_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.md"), source("https://x.com/a", "A")).unwrap();
        std::fs::write(dir.path().join("b.md"), source("https://x.com/b", "B")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let collection = create_collection_from_directory(dir.path(), &Registries::standard()).unwrap();
        assert_eq!(collection.len(), 2);
    }
}
