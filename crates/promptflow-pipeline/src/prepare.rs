//! Preparation: the derived fields a pipeline can carry precomputed.
//!
//! Everything here is pure. The executor derives the same values on the fly
//! for an unprepared pipeline, so both forms run identically.

use promptflow_llm::ModelRequirements;
use promptflow_markdown::{BlockType, KnowledgeSource};

use crate::pipeline::{
    CompiledPipeline, KnowledgePiece, KnowledgeSourceDeclaration, PersonaDeclaration, Preparation,
    Task,
};

pub fn is_pipeline_prepared(pipeline: &CompiledPipeline) -> bool {
    !pipeline.preparations.is_empty()
}

/// System message a persona contributes to its tasks' prompts.
pub fn persona_system_message(persona: &PersonaDeclaration) -> String {
    match persona.description.as_deref() {
        Some(description) if !description.trim().is_empty() => {
            format!("You are {}, {}.", persona.name, description.trim().trim_end_matches('.'))
        }
        _ => format!("You are {}.", persona.name),
    }
}

/// Split one source into pieces. Inline text splits on blank lines;
/// URL and file sources stay a single reference piece.
pub fn split_knowledge(source: &KnowledgeSourceDeclaration) -> Vec<KnowledgePiece> {
    let contents: Vec<String> = match &source.source {
        KnowledgeSource::Inline(text) => text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        KnowledgeSource::Url(locator) | KnowledgeSource::File(locator) => {
            vec![format!("Source: {locator}")]
        }
    };
    contents
        .into_iter()
        .enumerate()
        .map(|(index, content)| KnowledgePiece {
            source: source.name.clone(),
            index,
            content,
        })
        .collect()
}

/// Text bound to `{knowledge}` for `task`.
pub fn task_knowledge(pipeline: &CompiledPipeline, task: &Task) -> String {
    let mut pieces = Vec::new();
    for name in &task.knowledge {
        if is_pipeline_prepared(pipeline) {
            pieces.extend(
                pipeline
                    .knowledge_pieces
                    .iter()
                    .filter(|p| &p.source == name)
                    .map(|p| p.content.clone()),
            );
        } else if let Some(source) = pipeline.knowledge_source(name) {
            pieces.extend(split_knowledge(source).into_iter().map(|p| p.content));
        }
    }
    pieces.join("\n\n")
}

/// Template the executor resolves for `task`: the prepared content when
/// present, otherwise the content with a knowledge section appended for
/// prompt tasks that have knowledge but do not place it themselves.
pub fn task_template(task: &Task) -> String {
    if let Some(prepared) = &task.prepared_content {
        return prepared.clone();
    }
    let places_knowledge = task.content.contains("{knowledge}");
    if task.block_type == BlockType::PromptTemplate && !task.knowledge.is_empty() && !places_knowledge
    {
        format!("{}\n\n## Knowledge\n\n{{knowledge}}", task.content)
    } else {
        task.content.clone()
    }
}

/// Requirements for a prompt task's model call, with the persona's system
/// message applied.
pub fn task_model_requirements(pipeline: &CompiledPipeline, task: &Task) -> ModelRequirements {
    let mut requirements = task.model_requirements.clone();
    if let Some(persona) = task.persona.as_deref().and_then(|p| pipeline.persona(p)) {
        let system_message = persona
            .model_requirements
            .as_ref()
            .and_then(|r| r.system_message.clone())
            .unwrap_or_else(|| persona_system_message(persona));
        requirements.system_message = Some(system_message);
    }
    requirements
}

/// New value with every preparation-only field filled.
pub fn prepare_pipeline(pipeline: &CompiledPipeline) -> CompiledPipeline {
    let mut prepared = unprepare_pipeline(pipeline);

    for persona in &mut prepared.personas {
        persona.model_requirements = Some(ModelRequirements {
            system_message: Some(persona_system_message(persona)),
            ..ModelRequirements::default()
        });
    }
    prepared.knowledge_pieces = prepared
        .knowledge_sources
        .iter()
        .flat_map(split_knowledge)
        .collect();
    for task in &mut prepared.tasks {
        task.prepared_content = Some(task_template(task));
    }
    prepared.preparations = vec![Preparation {
        id: "preparation-1".to_string(),
        promptflow_version: env!("CARGO_PKG_VERSION").to_string(),
        persona_count: prepared.personas.len(),
        knowledge_piece_count: prepared.knowledge_pieces.len(),
    }];

    tracing::debug!(
        title = %prepared.title,
        pieces = prepared.knowledge_pieces.len(),
        "Pipeline prepared"
    );
    prepared
}

/// New value with every preparation-only field cleared. Idempotent.
pub fn unprepare_pipeline(pipeline: &CompiledPipeline) -> CompiledPipeline {
    let mut stripped = pipeline.clone();
    for persona in &mut stripped.personas {
        persona.model_requirements = None;
    }
    for task in &mut stripped.tasks {
        task.prepared_content = None;
    }
    stripped.knowledge_pieces.clear();
    stripped.preparations.clear();
    stripped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_pipeline;
    use crate::registries::Registries;

    const SOURCE: &str = r#"# Advisor

- INPUT PARAMETER {question}
- OUTPUT PARAMETER {answer}
- PERSONA Jane, a patient librarian
- KNOWLEDGE Cats sleep a lot.

## Answer

```
Answer {question}
```

-> {answer}
"#;

    fn compiled() -> CompiledPipeline {
        compile_pipeline(SOURCE, &Registries::standard()).unwrap()
    }

    #[test]
    fn prepare_fills_derived_fields() {
        let pipeline = compiled();
        assert!(!is_pipeline_prepared(&pipeline));

        let prepared = prepare_pipeline(&pipeline);
        assert!(is_pipeline_prepared(&prepared));
        assert_eq!(prepared.knowledge_pieces.len(), 1);
        assert_eq!(
            prepared.personas[0]
                .model_requirements
                .as_ref()
                .and_then(|r| r.system_message.as_deref()),
            Some("You are Jane, a patient librarian.")
        );
        let content = prepared.tasks[0].prepared_content.as_deref().unwrap();
        assert!(content.ends_with("## Knowledge\n\n{knowledge}"));
    }

    #[test]
    fn unprepare_round_trips_and_is_idempotent() {
        let pipeline = compiled();
        let prepared = prepare_pipeline(&pipeline);
        let once = unprepare_pipeline(&prepared);
        let twice = unprepare_pipeline(&once);
        assert_eq!(once, pipeline);
        assert_eq!(twice, once);
        assert_eq!(prepare_pipeline(&prepared), prepared);
    }

    #[test]
    fn prepared_and_unprepared_agree() {
        let pipeline = compiled();
        let prepared = prepare_pipeline(&pipeline);
        let task = &pipeline.tasks[0];
        let prepared_task = &prepared.tasks[0];
        assert_eq!(task_template(task), task_template(prepared_task));
        assert_eq!(task_knowledge(&pipeline, task), task_knowledge(&prepared, prepared_task));
        assert_eq!(
            task_model_requirements(&pipeline, task),
            task_model_requirements(&prepared, prepared_task)
        );
    }

    #[test]
    fn inline_knowledge_splits_on_blank_lines() {
        let source = KnowledgeSourceDeclaration {
            name: "facts".into(),
            source: KnowledgeSource::Inline("one\n\n\ntwo\n\n".into()),
        };
        let pieces = split_knowledge(&source);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[1].content, "two");
        assert_eq!(pieces[1].index, 1);
    }
}
