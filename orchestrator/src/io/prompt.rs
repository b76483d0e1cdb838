//! Task prompt rendering for command-backed executors.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::io::executor::TaskRequest;

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

#[derive(Debug, Serialize)]
struct TaskContext<'a> {
    wave: u32,
    task_number: u32,
    subagent_type: &'a str,
    description: &'a str,
}

#[derive(Debug, Serialize)]
struct ItemContext<'a> {
    title: &'a str,
    problem: Option<&'a str>,
    solution: Option<&'a str>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .context("parse task prompt template")?;
        Ok(Self { env })
    }

    pub fn render_task(&self, request: &TaskRequest) -> Result<String> {
        let template = self.env.get_template("task")?;
        let rendered = template
            .render(context! {
                repo => request.repo.display().to_string(),
                branch => request.branch.as_str(),
                run_id => request.run_id.as_str(),
                total_waves => request.total_waves,
                task => TaskContext {
                    wave: request.wave,
                    task_number: request.task_number,
                    subagent_type: request.subagent_type.as_str(),
                    description: request.description.trim(),
                },
                item => ItemContext {
                    title: request.item_title.trim(),
                    problem: Some(request.item_problem.trim()).filter(|s| !s.is_empty()),
                    solution: Some(request.item_solution.trim()).filter(|s| !s.is_empty()),
                },
            })
            .context("render task prompt")?;
        Ok(rendered)
    }
}
