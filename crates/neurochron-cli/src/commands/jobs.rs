//! Job commands.

use anyhow::Result;

use crate::client::{ApiClient, JobView, SubmitRequest};

pub async fn submit(api_url: &str, input: String, age: u32, contact: String) -> Result<()> {
    let client = ApiClient::new(api_url)?;
    let response = client
        .submit(&SubmitRequest {
            input_reference: input,
            chronological_age: age,
            contact,
        })
        .await?;
    println!("Submitted job {} ({})", response.id, response.status);
    Ok(())
}

pub async fn status(api_url: &str, id: &str) -> Result<()> {
    let client = ApiClient::new(api_url)?;
    let job = client.get_job(id).await?;
    for line in render(&job) {
        println!("{line}");
    }
    Ok(())
}

pub async fn list(api_url: &str, status: Option<&str>, limit: usize) -> Result<()> {
    let client = ApiClient::new(api_url)?;
    let jobs = client.list_jobs(status, limit).await?;
    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }
    println!("{:<38} {:<14} {:>4}  {}", "ID", "STATUS", "AGE", "SUBMITTED");
    for job in &jobs {
        println!(
            "{:<38} {:<14} {:>4}  {}",
            job.id,
            job.status,
            job.chronological_age,
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn cancel(api_url: &str, id: &str) -> Result<()> {
    let client = ApiClient::new(api_url)?;
    let job = client.cancel(id).await?;
    if job.status.is_terminal() {
        println!("Job {} cancelled", job.id);
    } else {
        println!(
            "Cancellation requested for job {}; it stops after its current step",
            job.id
        );
    }
    Ok(())
}

fn render(job: &JobView) -> Vec<String> {
    let mut lines = vec![
        format!("Job:      {}", job.id),
        format!("Status:   {}", job.status),
        format!("          {}", job.message),
        format!("Subject:  {}", job.subject_id),
        format!("Age:      {}", job.chronological_age),
        format!("Updated:  {}", job.updated_at.format("%Y-%m-%d %H:%M:%S")),
    ];
    if let Some(finished) = job.finished_at {
        lines.push(format!("Finished: {}", finished.format("%Y-%m-%d %H:%M:%S")));
    }
    for (stage, artifact) in &job.artifacts {
        lines.push(format!("Artifact: {stage} -> {artifact}"));
    }
    if let Some(result) = &job.result {
        lines.push(format!("Predicted brain age: {:.1}", result.predicted_age));
        lines.push(format!("Brain age gap:       {:+.1}", result.brain_age_gap));
        lines.push(result.interpretation.clone());
    }
    if let Some(error) = &job.error {
        let stage = error.stage.as_deref().unwrap_or("dispatch");
        lines.push(format!(
            "Error:    {} (during {stage}, {} retries)",
            error.category, error.retry_count
        ));
        lines.push(format!("Detail:   {}", error.message));
    }
    if let Some(notification) = &job.notification {
        if !notification.delivered {
            lines.push("Warning:  result notification was not delivered".to_string());
        }
    }
    if job.cancel_requested && !job.status.is_terminal() {
        lines.push("Cancellation pending".to_string());
    }
    lines
}
