//! `subject put|show|remove`: subject records for `${subject.*}` references.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use console::style;

use autoflow_core::repository::subject::SubjectLookup;
use autoflow_types::workflow::SubjectRef;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum SubjectCommand {
    /// Insert or replace a subject's fields.
    Put {
        /// Subject kind (e.g. `episode`).
        kind: String,
        /// Subject id.
        id: String,
        /// Fields as a JSON object.
        fields: String,
    },

    /// Print a subject's fields.
    Show { kind: String, id: String },

    /// Delete a subject.
    #[command(alias = "rm")]
    Remove { kind: String, id: String },
}

pub async fn handle_subject_command(cmd: SubjectCommand, state: &AppState, json: bool) -> Result<()> {
    let subjects = state.runtime.subjects();

    match cmd {
        SubjectCommand::Put { kind, id, fields } => {
            let subject = SubjectRef::new(kind, id);
            let fields: serde_json::Value =
                serde_json::from_str(&fields).context("invalid JSON for subject fields")?;
            subjects.put(&subject, &fields).await?;

            if json {
                let out = serde_json::json!({ "subject": subject.to_string(), "fields": fields });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!(
                    "  {} Stored subject {}",
                    style("*").green().bold(),
                    style(&subject).cyan()
                );
            }
        }
        SubjectCommand::Show { kind, id } => {
            let subject = SubjectRef::new(kind, id);
            let Some(fields) = subjects.fetch(&subject).await? else {
                bail!("subject {subject} not found");
            };
            println!("{}", serde_json::to_string_pretty(&fields)?);
        }
        SubjectCommand::Remove { kind, id } => {
            let subject = SubjectRef::new(kind, id);
            let removed = subjects.remove(&subject).await?;
            if json {
                let out = serde_json::json!({ "subject": subject.to_string(), "removed": removed });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if removed {
                println!("  {} Removed subject {}", style("*").green().bold(), subject);
            } else {
                println!("  Subject {subject} did not exist.");
            }
        }
    }
    Ok(())
}
