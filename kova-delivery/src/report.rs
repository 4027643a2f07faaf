//! Turning a result array into statistics and a readable report.
//!
//! Counting is done once, from the results themselves, so the numbers in the
//! text always add up: every result is either sent or failed, and
//! `overall.sent + overall.failed == results.len()`.

use std::{collections::HashMap, fmt::Write as _};

use serde::{Deserialize, Serialize};

use crate::{JobKind, MailJob, SendResult};

/// Sent/failed counts for one phase (or all of them).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseStats {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
}

impl PhaseStats {
    fn record(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.sent += 1;
        } else {
            self.failed += 1;
        }
    }

    /// `None` when the phase had no jobs.
    #[must_use]
    pub const fn succeeded(&self) -> Option<bool> {
        if self.total == 0 {
            None
        } else {
            Some(self.failed == 0)
        }
    }
}

/// Machine-checkable statistics of one batch.
///
/// Per-phase and overall counts are both exposed; callers pick the
/// granularity they report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub group: PhaseStats,
    pub input: PhaseStats,
    pub bulk: PhaseStats,
    pub overall: PhaseStats,
    pub successful_destinations: usize,
    pub failed_destinations: usize,
}

impl DispatchStats {
    /// Group and input mails combined, as `(sent, failed)`.
    #[must_use]
    pub const fn delivery_totals(&self) -> (usize, usize) {
        (
            self.group.sent + self.input.sent,
            self.group.failed + self.input.failed,
        )
    }

    #[must_use]
    pub const fn input_succeeded(&self) -> Option<bool> {
        self.input.succeeded()
    }

    #[must_use]
    pub const fn bulk_succeeded(&self) -> Option<bool> {
        self.bulk.succeeded()
    }
}

/// Group-phase outcome for one destination.
///
/// A destination succeeds when any of its sends succeeded; failed sends and
/// recipients the relay refused are still listed in `errors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationSummary {
    pub id: String,
    pub name: String,
    pub categories: Vec<String>,
    pub row_count: Option<usize>,
    pub filename: Option<String>,
    pub recipients_total: usize,
    pub recipients_succeeded: usize,
    pub success: bool,
    pub errors: Vec<String>,
}

/// Extra information the caller wants in the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportContext {
    /// First line of the text report
    #[serde(default)]
    pub title: Option<String>,
    /// Data categories that matched no destination
    #[serde(default)]
    pub unmatched_categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub stats: DispatchStats,
    pub destinations: Vec<DestinationSummary>,
    /// At most `max_sample_errors` lines, each at most `max_error_len` characters
    pub sample_errors: Vec<String>,
    pub unmatched_categories: Vec<String>,
    /// Human readable summary, at most `max_report_len` characters
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ResultAccountant {
    pub max_sample_errors: usize,
    pub max_error_len: usize,
    pub max_report_len: usize,
    /// Unmatched categories listed before "... and N more"
    pub max_listed_categories: usize,
}

impl Default for ResultAccountant {
    fn default() -> Self {
        Self {
            max_sample_errors: 3,
            max_error_len: 200,
            max_report_len: 3500,
            max_listed_categories: 3,
        }
    }
}

const TRUNCATION_MARKER: &str = "\n... (report truncated)";

impl ResultAccountant {
    #[must_use]
    pub fn stats(&self, results: &[SendResult]) -> DispatchStats {
        let destinations = self.destinations(&[], results);
        Self::count(results, &destinations)
    }

    fn count(results: &[SendResult], destinations: &[DestinationSummary]) -> DispatchStats {
        let mut stats = DispatchStats::default();
        for result in results {
            let phase = match result.kind {
                JobKind::Group => &mut stats.group,
                JobKind::Input => &mut stats.input,
                JobKind::Bulk => &mut stats.bulk,
            };
            phase.record(result.success);
            stats.overall.record(result.success);
        }

        stats.successful_destinations = destinations.iter().filter(|d| d.success).count();
        stats.failed_destinations = destinations.len() - stats.successful_destinations;
        stats
    }

    /// Group results folded per destination, in order of first appearance.
    ///
    /// `jobs` supplies categories, row counts and file names; it may be empty.
    #[must_use]
    pub fn destinations(&self, jobs: &[MailJob], results: &[SendResult]) -> Vec<DestinationSummary> {
        let mut summaries: Vec<DestinationSummary> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for result in results.iter().filter(|r| r.kind == JobKind::Group) {
            let id = result
                .destination_id
                .clone()
                .unwrap_or_else(|| format!("job-{}", result.job_index));

            let position = *positions.entry(id.clone()).or_insert_with(|| {
                let metadata = jobs.get(result.job_index).map(MailJob::metadata);
                summaries.push(DestinationSummary {
                    id,
                    name: result.display_name(),
                    categories: metadata.map(|m| m.categories.clone()).unwrap_or_default(),
                    row_count: metadata.and_then(|m| m.row_count),
                    filename: metadata.and_then(|m| m.filename.clone()),
                    recipients_total: 0,
                    recipients_succeeded: 0,
                    success: false,
                    errors: Vec::new(),
                });
                summaries.len() - 1
            });

            let summary = &mut summaries[position];
            summary.recipients_total += result.recipients.len();
            if result.success {
                summary.recipients_succeeded += result.accepted_recipients().count();
                summary.success = true;
            } else if let Some(error) = &result.error {
                summary.errors.push(self.clip(error));
            }
            for refused in &result.refused {
                summary
                    .errors
                    .push(self.clip(&format!("{}: {}", refused.address, refused.reply)));
            }
        }

        summaries
    }

    /// Bounded sample of failure lines across every phase, and how many
    /// lines were left out.
    ///
    /// A failed send is one line; each recipient refused on a successful send
    /// is a line of its own.
    fn sample_errors(&self, results: &[SendResult]) -> (Vec<String>, usize) {
        let mut lines = results.iter().flat_map(|r| {
            let failure = (!r.success).then(|| {
                let who = if r.recipients.is_empty() {
                    r.display_name()
                } else {
                    r.recipients.join(", ")
                };
                format!("{who}: {}", r.error.as_deref().unwrap_or("unknown error"))
            });
            let refusals = r
                .refused
                .iter()
                .map(|refused| format!("{}: {}", refused.address, refused.reply));
            failure.into_iter().chain(refusals)
        });

        let shown: Vec<String> = lines
            .by_ref()
            .take(self.max_sample_errors)
            .map(|line| self.clip(&line))
            .collect();
        (shown, lines.count())
    }

    #[must_use]
    pub fn report(
        &self,
        jobs: &[MailJob],
        results: &[SendResult],
        context: &ReportContext,
    ) -> DispatchReport {
        let destinations = self.destinations(jobs, results);
        let stats = Self::count(results, &destinations);
        let (sample_errors, hidden_errors) = self.sample_errors(results);
        let text = self.render(&stats, &destinations, &sample_errors, hidden_errors, context);

        DispatchReport {
            stats,
            destinations,
            sample_errors,
            unmatched_categories: context.unmatched_categories.clone(),
            text,
        }
    }

    fn render(
        &self,
        stats: &DispatchStats,
        destinations: &[DestinationSummary],
        sample_errors: &[String],
        hidden_errors: usize,
        context: &ReportContext,
    ) -> String {
        let mut out = String::new();
        let title = context.title.as_deref().unwrap_or("Mail dispatch report");
        let _ = writeln!(out, "{title}");
        let _ = writeln!(
            out,
            "Time: {}",
            chrono::Utc::now().format("%d.%m.%Y %H:%M UTC")
        );

        out.push_str("\nStatistics\n");
        let _ = writeln!(out, "• Destinations: {}", destinations.len());
        let _ = writeln!(
            out,
            "• {} successful group mails, {} failed",
            stats.group.sent, stats.group.failed
        );
        if let Some(ok) = stats.input_succeeded() {
            let _ = writeln!(out, "• Input mail: {}", mark(ok));
        }
        if let Some(ok) = stats.bulk_succeeded() {
            let _ = writeln!(out, "• Bulk mail: {}", mark(ok));
        }

        out.push_str("\nDestinations\n");
        if destinations.is_empty() {
            out.push_str("No destination received data.\n");
        }
        for destination in destinations {
            let _ = write!(out, "• {} {}", mark(destination.success), destination.name);
            if let Some(filename) = &destination.filename {
                let _ = write!(out, ": {filename}");
            }
            if let Some(rows) = destination.row_count {
                let _ = write!(out, " ({rows} rows)");
            }
            if !destination.categories.is_empty() {
                let _ = write!(out, " [{}]", destination.categories.join(", "));
            }
            out.push('\n');
        }

        let unmatched = &context.unmatched_categories;
        if !unmatched.is_empty() {
            let _ = write!(out, "\nUnmatched categories ({})\n", unmatched.len());
            for category in unmatched.iter().take(self.max_listed_categories) {
                let _ = writeln!(out, "• {category}");
            }
            if unmatched.len() > self.max_listed_categories {
                let _ = writeln!(
                    out,
                    "• ... and {} more",
                    unmatched.len() - self.max_listed_categories
                );
            }
        }

        if !sample_errors.is_empty() {
            out.push_str("\nMail errors\n");
            for line in sample_errors {
                let _ = writeln!(out, "• {line}");
            }
            if hidden_errors > 0 {
                let _ = writeln!(out, "• ... and {hidden_errors} more errors");
            }
        }

        self.bound(out.trim_end().to_string())
    }

    fn clip(&self, text: &str) -> String {
        if text.chars().count() <= self.max_error_len {
            return text.to_string();
        }
        let mut clipped: String = text.chars().take(self.max_error_len.saturating_sub(3)).collect();
        clipped.push_str("...");
        clipped
    }

    fn bound(&self, text: String) -> String {
        if text.chars().count() <= self.max_report_len {
            return text;
        }
        let keep = self
            .max_report_len
            .saturating_sub(TRUNCATION_MARKER.chars().count());
        let mut bounded: String = text.chars().take(keep).collect();
        bounded.push_str(TRUNCATION_MARKER);
        bounded
    }
}

const fn mark(ok: bool) -> &'static str {
    if ok { "✅" } else { "❌" }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{MailError, RefusedRecipient};

    fn group(id: &str, recipient: &str) -> MailJob {
        MailJob::builder(JobKind::Group)
            .recipient(recipient)
            .subject("Rows")
            .destination(id, format!("Office {id}"))
            .categories(["Ankara", "Konya"])
            .row_count(12)
            .filename(format!("{id}.xlsx"))
            .build()
            .unwrap()
    }

    fn single(kind: JobKind) -> MailJob {
        MailJob::builder(kind)
            .recipient("me@example.com")
            .subject("Copy")
            .build()
            .unwrap()
    }

    fn failed(index: usize, job: &MailJob, reason: &str) -> SendResult {
        SendResult::failure(
            index,
            job,
            &MailError::Connection(reason.to_string()),
            3,
        )
    }

    #[test]
    fn test_scenario_counts_and_text() {
        let jobs = vec![
            group("a", "a@example.org"),
            group("b", "b@example.org"),
            group("c", "c@example.org"),
            single(JobKind::Input),
            single(JobKind::Bulk),
        ];
        let results = vec![
            SendResult::success(0, &jobs[0], 1),
            SendResult::success(1, &jobs[1], 1),
            failed(2, &jobs[2], "reset by peer"),
            SendResult::success(3, &jobs[3], 1),
            SendResult::success(4, &jobs[4], 1),
        ];

        let report = ResultAccountant::default().report(&jobs, &results, &ReportContext::default());

        assert_eq!(report.stats.group, PhaseStats { total: 3, sent: 2, failed: 1 });
        assert_eq!(report.stats.overall.sent + report.stats.overall.failed, results.len());
        assert_eq!(report.stats.input_succeeded(), Some(true));
        assert_eq!(report.stats.bulk_succeeded(), Some(true));
        assert_eq!(report.stats.delivery_totals(), (3, 1));
        assert_eq!(report.stats.successful_destinations, 2);
        assert_eq!(report.stats.failed_destinations, 1);

        assert!(report.text.contains("2 successful group mails, 1 failed"));
        assert!(report.text.contains("• Input mail: ✅"));
        assert!(report.text.contains("Office a: a.xlsx (12 rows) [Ankara, Konya]"));
        assert_eq!(
            report.sample_errors,
            vec!["c@example.org: Connection failed: reset by peer".to_string()]
        );
    }

    #[test]
    fn test_destination_with_any_success_counts_as_successful() {
        let first = group("ankara", "one@example.org");
        let second = group("ankara", "two@example.org");
        let jobs = vec![first, second];
        let results = vec![
            SendResult::success(0, &jobs[0], 1),
            failed(1, &jobs[1], "mailbox full"),
        ];

        let report = ResultAccountant::default().report(&jobs, &results, &ReportContext::default());

        assert_eq!(report.destinations.len(), 1);
        let destination = &report.destinations[0];
        assert!(destination.success);
        assert_eq!(destination.recipients_total, 2);
        assert_eq!(destination.recipients_succeeded, 1);
        assert_eq!(destination.errors.len(), 1);
        assert_eq!(report.stats.successful_destinations, 1);
        assert!(report.sample_errors[0].starts_with("two@example.org: "));
    }

    #[test]
    fn test_refused_recipients_are_accounted() {
        let job = MailJob::builder(JobKind::Group)
            .recipients(["ok@example.org", "unknown@example.org"])
            .subject("Rows")
            .destination("izmir", "Office izmir")
            .build()
            .unwrap();
        let jobs = vec![job];
        let results = vec![SendResult::success(0, &jobs[0], 1).with_refused(vec![
            RefusedRecipient {
                address: "unknown@example.org".to_string(),
                reply: "550 No such user".to_string(),
            },
        ])];

        let report = ResultAccountant::default().report(&jobs, &results, &ReportContext::default());

        let destination = &report.destinations[0];
        assert!(destination.success);
        assert_eq!(destination.recipients_total, 2);
        assert_eq!(destination.recipients_succeeded, 1);
        assert_eq!(destination.errors, vec!["unknown@example.org: 550 No such user".to_string()]);
        assert_eq!(report.stats.group, PhaseStats { total: 1, sent: 1, failed: 0 });
        assert_eq!(
            report.sample_errors,
            vec!["unknown@example.org: 550 No such user".to_string()]
        );
        assert!(report.text.contains("Mail errors\n• unknown@example.org: 550 No such user"));
    }

    #[test]
    fn test_hidden_error_count_includes_refusals() {
        let jobs: Vec<_> = (0..3)
            .map(|i| group(&format!("d{i}"), &format!("d{i}@example.org")))
            .collect();
        let refusal = |address: &str| RefusedRecipient {
            address: address.to_string(),
            reply: "550 No such user".to_string(),
        };
        let results = vec![
            failed(0, &jobs[0], "reset by peer"),
            SendResult::success(1, &jobs[1], 1)
                .with_refused(vec![refusal("x@example.org"), refusal("y@example.org")]),
            failed(2, &jobs[2], "reset by peer"),
        ];

        let report = ResultAccountant::default().report(&jobs, &results, &ReportContext::default());

        assert_eq!(report.sample_errors.len(), 3);
        assert_eq!(report.sample_errors[1], "x@example.org: 550 No such user");
        assert!(report.text.contains("• ... and 1 more errors"));
    }

    #[test]
    fn test_no_destinations_is_called_out() {
        let jobs = vec![single(JobKind::Input)];
        let results = vec![SendResult::success(0, &jobs[0], 1)];

        let report = ResultAccountant::default().report(&jobs, &results, &ReportContext::default());

        assert!(report.text.contains("No destination received data."));
        assert!(report.text.contains("0 successful group mails, 0 failed"));
        assert!(!report.text.contains("Bulk mail"));
    }

    #[test]
    fn test_sample_errors_are_bounded() {
        let jobs: Vec<_> = (0..6)
            .map(|i| group(&format!("d{i}"), &format!("d{i}@example.org")))
            .collect();
        let long = "x".repeat(500);
        let results: Vec<_> = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| failed(i, job, &long))
            .collect();

        let report = ResultAccountant::default().report(&jobs, &results, &ReportContext::default());

        assert_eq!(report.sample_errors.len(), 3);
        assert!(report.sample_errors.iter().all(|e| e.chars().count() <= 200));
        assert!(report.text.contains("• ... and 3 more errors"));
    }

    #[test]
    fn test_unmatched_categories_listed_then_summarised() {
        let context = ReportContext {
            title: Some("Excel processing report".to_string()),
            unmatched_categories: ["Rize", "Sinop", "Bartın", "Kars", "Muş"]
                .map(String::from)
                .to_vec(),
        };

        let report = ResultAccountant::default().report(&[], &[], &context);

        assert!(report.text.starts_with("Excel processing report\n"));
        assert!(report.text.contains("Unmatched categories (5)\n• Rize\n• Sinop\n• Bartın\n• ... and 2 more"));
        assert!(!report.text.contains("Kars"));
    }

    #[test]
    fn test_report_text_is_capped() {
        let accountant = ResultAccountant {
            max_report_len: 120,
            ..ResultAccountant::default()
        };
        let jobs: Vec<_> = (0..20)
            .map(|i| group(&format!("destination-{i}"), &format!("d{i}@example.org")))
            .collect();
        let results: Vec<_> = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| SendResult::success(i, job, 1))
            .collect();

        let report = accountant.report(&jobs, &results, &ReportContext::default());

        assert_eq!(report.text.chars().count(), 120);
        assert!(report.text.ends_with(TRUNCATION_MARKER));
        assert_eq!(report.destinations.len(), 20);
    }

    #[test]
    fn test_counts_always_add_up() {
        let jobs = vec![
            group("a", "a@example.org"),
            single(JobKind::Input),
            single(JobKind::Bulk),
            group("b", "b@example.org"),
        ];
        let outcomes = [true, false, false, true];

        let results: Vec<_> = jobs
            .iter()
            .zip(outcomes)
            .enumerate()
            .map(|(i, (job, ok))| {
                if ok {
                    SendResult::success(i, job, 1)
                } else {
                    failed(i, job, "nope")
                }
            })
            .collect();

        let stats = ResultAccountant::default().stats(&results);
        assert_eq!(stats.overall.total, results.len());
        assert_eq!(stats.overall.sent + stats.overall.failed, results.len());
        assert_eq!(
            stats.group.total + stats.input.total + stats.bulk.total,
            results.len()
        );
        assert_eq!(stats.input_succeeded(), Some(false));
    }
}
