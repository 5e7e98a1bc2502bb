//! Markdown and console rendering of bisection findings.

use std::path::Path;

use anyhow::Context;

use super::findings::{BisectReport, CombinedReport, ReportStatus};

/// Format a score for display.
pub fn format_score(value: f64) -> String {
    if value == 0.0 {
        "0".to_string()
    } else if value >= 1e4 || value < 1e-3 {
        format!("{:.3e}", value)
    } else {
        format!("{:.4}", value)
    }
}

fn score_cell(score: Option<crate::core::Score>) -> String {
    score.map(|s| format_score(s.value())).unwrap_or_else(|| "-".to_string())
}

/// Render one configuration's findings as a Markdown section.
pub fn render_report_section(out: &mut String, heading: &str, report: &BisectReport) {
    out.push_str(&format!(
        "### {} {}\n\n",
        report.status.emoji(),
        heading
    ));
    out.push_str(&format!(
        "| | |\n|---|---|\n\
         | **Test** | `{}` |\n\
         | **Precision** | {} |\n\
         | **Variant** | `{}` |\n\
         | **Status** | {} |\n\
         | **Whole-build score** | {} |\n\
         | **Verification score** | {} |\n\
         | **Trials** | {} |\n\n",
        report.test,
        report.precision,
        report.variant,
        report.status.label(),
        score_cell(report.whole_score),
        score_cell(report.verification_score),
        report.trials_executed
    ));

    if !report.files.is_empty() {
        out.push_str("| File | Score | Symbol | Location | Score |\n");
        out.push_str("|------|-------|--------|----------|-------|\n");
        for file in &report.files {
            if file.symbols.is_empty() {
                out.push_str(&format!(
                    "| `{}` | {} | - | - | - |\n",
                    file.unit,
                    format_score(file.score.value())
                ));
            }
            for (i, symbol) in file.symbols.iter().enumerate() {
                let (name, score) = if i == 0 {
                    (format!("`{}`", file.unit), format_score(file.score.value()))
                } else {
                    (String::new(), String::new())
                };
                out.push_str(&format!(
                    "| {} | {} | `{}` | {} | {} |\n",
                    name,
                    score,
                    symbol.site.signature,
                    symbol.site.location(),
                    format_score(symbol.score.value())
                ));
            }
        }
        out.push('\n');
    }

    if !report.interactions.is_empty() {
        out.push_str("**Interactions** (not attributable to single elements):\n\n");
        for interaction in &report.interactions {
            out.push_str(&format!(
                "- {}: [{}], isolated: [{}]\n",
                interaction.scope,
                interaction.members.join(", "),
                interaction.attributed.join(", ")
            ));
        }
        out.push('\n');
    }

    if !report.issues.is_empty() {
        out.push_str("| Issue | Context | Detail |\n|-------|---------|--------|\n");
        for issue in &report.issues {
            out.push_str(&format!(
                "| {} {} | {} | {} |\n",
                issue.kind.emoji(),
                issue.kind.label(),
                issue.context,
                issue.detail.replace('|', "\\|").replace('\n', " ")
            ));
        }
        out.push('\n');
    }
}

/// Render a combined auto-run report as Markdown.
pub fn render_markdown(report: &CombinedReport) -> String {
    let mut out = String::new();

    let status_emoji = if report.count_status(ReportStatus::GroundTruthFailure) > 0
        || report.count_status(ReportStatus::Aborted) > 0
    {
        "⚠️"
    } else {
        "✅"
    };
    out.push_str(&format!("## {} fp-bisect Report\n\n", status_emoji));

    out.push_str(&format!(
        "| | |\n|---|---|\n\
         | **Trusted** | `{}` |\n\
         | **Generated** | {} |\n",
        report.trusted,
        report.generated_at.get(..19).unwrap_or(&report.generated_at).replace('T', " ")
    ));
    if let Some(env) = &report.environment {
        out.push_str(&format!(
            "| **Host** | {} ({}) |\n",
            env.hostname.as_deref().unwrap_or("-"),
            env.os
        ));
        if let Some(sha) = &env.git_sha {
            out.push_str(&format!("| **Commit** | `{}` |\n", sha));
        }
    }
    out.push('\n');

    out.push_str("### Summary\n\n");
    out.push_str(&format!(
        "| Metric | Count |\n|--------|-------|\n\
         | Rows | {} |\n\
         | Skipped (zero score) | {} |\n\
         | Bisected | {} |\n\
         | Completed | {} |\n\
         | No baseline | {} |\n\
         | Issues | {} |\n\n",
        report.rows_total,
        report.rows_skipped,
        report.entries.len(),
        report.count_status(ReportStatus::Completed),
        report.count_status(ReportStatus::GroundTruthFailure),
        report.issue_count()
    ));

    for entry in &report.entries {
        let heading = format!("#{} {} / {}", entry.index, entry.report.test, entry.report.variant);
        render_report_section(&mut out, &heading, &entry.report);
    }

    out
}

/// Write the Markdown rendering of `report` to `path`, creating parent directories.
pub fn write_markdown(path: &Path, report: &CombinedReport) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    std::fs::write(path, render_markdown(report))
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Plain-text summary of a single bisection for the console.
pub fn render_text(report: &BisectReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} {} [{}] {} vs {}\n",
        report.status.label(),
        report.test,
        report.precision,
        report.variant,
        report.trusted
    ));
    out.push_str(&format!(
        "  whole-build score: {}, trials executed: {}\n",
        score_cell(report.whole_score),
        report.trials_executed
    ));

    if report.files.is_empty() {
        out.push_str("  no suspect files\n");
    } else {
        out.push_str("  suspect files:\n");
        for file in &report.files {
            out.push_str(&format!("    {}  score={}\n", file.unit, format_score(file.score.value())));
        }
        out.push_str("  suspect symbols:\n");
        for file in &report.files {
            for symbol in &file.symbols {
                out.push_str(&format!(
                    "    {}  {}  score={}\n",
                    symbol.site.location(),
                    symbol.site.signature,
                    format_score(symbol.score.value())
                ));
            }
        }
    }

    if let Some(score) = report.verification_score {
        out.push_str(&format!("  verification (suspect files only): {}\n", format_score(score.value())));
    }
    for interaction in &report.interactions {
        out.push_str(&format!(
            "  interaction in {}: [{}]\n",
            interaction.scope,
            interaction.members.join(" ")
        ));
    }
    for issue in &report.issues {
        out.push_str(&format!("  {}: {}: {}\n", issue.kind.label(), issue.context, issue.detail));
    }
    out
}
