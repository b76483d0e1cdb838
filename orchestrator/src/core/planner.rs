//! Wave planner: a pure mapping from one backlog item to ordered task waves.
//!
//! Planning must be re-derivable from the item alone. The driver recomputes the
//! plan on resume and reconciles it against persisted rows, so any change to the
//! output for an unchanged item breaks resume of in-flight runs.

use super::types::{BacklogItem, PlannedTask, SubagentType, Wave};

/// Upper bound on implementation tasks split out of one solution.
pub const MAX_IMPLEMENTATION_TASKS: usize = 4;

/// Complexity at or above which the analysis wave also gets a design task.
const DESIGN_TASK_COMPLEXITY: u8 = 3;

/// Produce the ordered waves for `item`.
///
/// Every item gets three waves: analysis, implementation, verification. The
/// implementation wave fans out over the bullet or numbered steps found in the
/// solution text (capped at [`MAX_IMPLEMENTATION_TASKS`]; overflow steps are
/// folded into the last task).
pub fn generate_waves_for_item(item: &BacklogItem) -> Vec<Wave> {
    let title = item.title.trim();
    let kind = ItemKind::from_type(&item.item_type);

    let mut analysis = vec![(
        SubagentType::Explore,
        format!(
            "Investigate the code affected by \"{title}\". Identify the files, call sites, and tests involved and summarize the current behavior behind this problem: {}",
            one_line(&item.problem)
        ),
    )];
    if item.complexity >= DESIGN_TASK_COMPLEXITY {
        analysis.push((
            SubagentType::Plan,
            format!(
                "Design the change for \"{title}\": list the edits in order, the risks, and how each will be verified."
            ),
        ));
    }

    let steps = solution_steps(&item.solution);
    let implementation: Vec<(SubagentType, String)> = if steps.is_empty() {
        vec![(
            SubagentType::GeneralPurpose,
            format!(
                "Implement \"{title}\": {}",
                one_line(&item.solution)
            ),
        )]
    } else {
        group_steps(steps)
            .into_iter()
            .map(|step| {
                (
                    SubagentType::GeneralPurpose,
                    format!("Implement part of \"{title}\": {step}"),
                )
            })
            .collect()
    };

    let mut verification = Vec::new();
    if kind != ItemKind::Docs {
        verification.push((
            SubagentType::TestWriter,
            format!(
                "Add or update tests covering \"{title}\" and run the project's test suite; fix any failures introduced by this change."
            ),
        ));
    }
    verification.push((
        SubagentType::CodeReviewer,
        format!(
            "Review the changes made for \"{title}\" against the stated problem and solution; fix correctness or style issues you find."
        ),
    ));

    [analysis, implementation, verification]
        .into_iter()
        .enumerate()
        .map(|(idx, specs)| build_wave(idx as u32 + 1, specs))
        .collect()
}

/// Flatten waves into the rows the store persists.
pub fn planned_tasks(waves: &[Wave]) -> Vec<PlannedTask> {
    waves.iter().flat_map(|wave| wave.tasks.clone()).collect()
}

fn build_wave(number: u32, specs: Vec<(SubagentType, String)>) -> Wave {
    let tasks = specs
        .into_iter()
        .enumerate()
        .map(|(idx, (subagent_type, description))| PlannedTask {
            wave: number,
            task_number: idx as u32 + 1,
            subagent_type,
            description,
        })
        .collect();
    Wave { number, tasks }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Docs,
    Other,
}

impl ItemKind {
    fn from_type(item_type: &str) -> Self {
        match item_type.trim().to_ascii_lowercase().as_str() {
            "docs" | "documentation" => ItemKind::Docs,
            _ => ItemKind::Other,
        }
    }
}

/// Extract list items (`- `, `* `, `1. `, `1) `) from solution text.
fn solution_steps(solution: &str) -> Vec<String> {
    solution
        .lines()
        .filter_map(|line| strip_list_marker(line.trim()))
        .map(str::trim)
        .filter(|step| !step.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_list_marker(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return Some(rest);
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") "))
}

fn group_steps(mut steps: Vec<String>) -> Vec<String> {
    if steps.len() <= MAX_IMPLEMENTATION_TASKS {
        return steps;
    }
    let overflow = steps.split_off(MAX_IMPLEMENTATION_TASKS - 1);
    steps.push(overflow.join("; "));
    steps
}

fn one_line(text: &str) -> String {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        "(no details provided)".to_string()
    } else {
        joined
    }
}
