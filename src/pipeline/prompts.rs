//! Prompt builders for the evaluation pipeline
//!
//! Every prompt asks for one JSON object keyed by challenge id so a single
//! call covers all pending challenges of a project.

use std::collections::BTreeMap;

use crate::types::{Challenge, Dimension, DimensionSet, Project};

pub const JUDGE_SYSTEM: &str = "You are an experienced hackathon judge. You review submitted \
projects strictly against the challenge requirements you are given and answer with valid JSON only.";

fn challenges_block(challenges: &[Challenge]) -> String {
    challenges
        .iter()
        .map(|c| {
            if c.description.trim().is_empty() {
                format!("- id \"{}\": {}", c.id, c.name)
            } else {
                format!("- id \"{}\": {}\n  {}", c.id, c.name, c.description.trim())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn id_list(challenges: &[Challenge]) -> String {
    challenges
        .iter()
        .map(|c| format!("\"{}\"", c.id))
        .collect::<Vec<_>>()
        .join(", ")
}

fn focus(dimension: Dimension) -> &'static str {
    match dimension {
        Dimension::Technical => {
            "code quality, architecture, correct and idiomatic use of the required technologies, \
             completeness of the implementation and how well it meets each challenge's technical requirements"
        }
        Dimension::Ux => {
            "usability, clarity of the user flows, interface polish, accessibility and onboarding \
             as far as they can be inferred from the code and description"
        }
        Dimension::Business => {
            "market need, target users, viability of the business model, go-to-market potential \
             and alignment with each challenge sponsor's ecosystem"
        }
        Dimension::Innovation => {
            "originality, novelty of the approach, creative use of the challenge technologies and \
             potential impact compared to existing solutions"
        }
    }
}

/// Structured analysis of one chunk of an oversized code bundle
pub fn chunk_analysis_prompt(
    project: &Project,
    challenges: &[Challenge],
    chunk: &str,
    index: usize,
    total: usize,
) -> String {
    format!(
        r#"<project_description>
{description}
</project_description>

<code_part index="{part}" total="{total}">
{chunk}
</code_part>

<challenges>
{challenges}
</challenges>

<instructions>
You are looking at part {part} of {total} of the code of project "{name}".
Analyze only this part and return a JSON object with these fields:
- "technologies": technologies, frameworks and libraries used in this part
- "projectNameHints": possible names of the project seen in this part
- "features": user-facing features implemented in this part
- "potentialChallenges": ids of the challenges above this part is relevant to
- "description": one or two sentences describing what this part does
- "technicalDigest": a dense technical summary of this part (architecture, key modules,
  notable implementation details, use of challenge technologies) that a reviewer can use
  instead of reading the code
Return JSON only.
</instructions>"#,
        description = project.description,
        part = index + 1,
        total = total,
        chunk = chunk,
        challenges = challenges_block(challenges),
        name = project.name,
    )
}

/// One dimension's analysis for every pending challenge
pub fn dimension_prompt(dimension: Dimension, project: &Project, challenges: &[Challenge], document: &str) -> String {
    format!(
        r#"<project_description>
{description}
</project_description>

<project_code>
{document}
</project_code>

<challenges>
{challenges}
</challenges>

<instructions>
Evaluate the {label} of project "{name}" for each challenge above.
Focus on {focus}.

Return strictly a JSON object where each key is a challenge id ({ids}) and each value is a
detailed {dimension} analysis specific to that challenge's requirements, as a string.
Use the real challenge ids, not placeholders.
</instructions>"#,
        description = project.description,
        document = document,
        challenges = challenges_block(challenges),
        label = dimension.label(),
        name = project.name,
        focus = focus(dimension),
        ids = id_list(challenges),
        dimension = dimension.as_str(),
    )
}

/// Summary and 0-10 score for each analysis of one dimension
pub fn summary_prompt(dimension: Dimension, analyses: &BTreeMap<String, String>) -> String {
    let entries = analyses
        .iter()
        .map(|(id, text)| format!("<review challenge_id=\"{}\">\n{}\n</review>", id, text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"{entries}

<instructions>
Each review above is a {label} assessment of one project for one challenge.
For every review produce:
1. A concise summary (2-3 sentences) of its key points.
2. A score out of 10 based on the review content. If the review states a score, use it.

Return a JSON object keyed by challenge id:
{{
  "<challenge id>": {{ "summary": "...", "score": 7.5 }}
}}
Return JSON only.
</instructions>"#,
        entries = entries,
        label = dimension.label(),
    )
}

/// Batched final synthesis across all pending challenges
pub fn synthesis_prompt(project: &Project, results: &BTreeMap<String, DimensionSet>) -> String {
    let mut assessments = String::new();
    for (id, dims) in results {
        assessments.push_str(&format!("<challenge id=\"{}\">\n", id));
        for dimension in Dimension::ALL {
            let r = dims.get(dimension);
            assessments.push_str(&format!(
                "{} (score {:.1}/10): {}\n",
                dimension.label(),
                r.score,
                r.summary
            ));
        }
        assessments.push_str(&format!(
            "Weighted score: {:.2}/10\n</challenge>\n",
            dims.weighted_score()
        ));
    }

    format!(
        r#"<assessments project="{name}">
{assessments}</assessments>

<scoring_weights>
1. Technical Implementation: 30%
2. Innovation: 30%
3. User Experience: 20%
4. Business Potential: 20%
</scoring_weights>

<instructions>
For each challenge write a final review of the project based only on the assessments above:
key findings per dimension, 3-5 strengths, 2-3 areas to improve and 2-3 concrete
recommendations. The weighted score is already computed; do not recompute it.

Return a JSON object keyed by challenge id:
{{
  "<challenge id>": {{ "analysis": "full final review", "summary": "2-3 sentence summary" }}
}}
Return JSON only.
</instructions>"#,
        name = project.name,
        assessments = assessments,
    )
}
