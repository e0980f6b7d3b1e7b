//! Prompt assembly for phase generation.
//!
//! Each prompt has the same shape: role instructions, the manifesto, the
//! accumulated context rendered by the budget, then the phase task and the
//! hurdle-reporting convention.

use crate::compaction::truncate_to_tokens;
use crate::generate::strip_hurdles;
use crate::phase::Phase;

/// Maximum tokens of the manifesto carried in a prompt.
const MAX_MANIFESTO_TOKENS: u64 = 8_000;

/// Longest PR title accepted by most hosting services without wrapping.
const MAX_TITLE_CHARS: usize = 72;

const HURDLE_INSTRUCTIONS: &str = "\
If you hit a technical obstacle you cannot resolve, report it on its own line as
<hurdle severity=\"low|medium|high|critical\">what is blocking you</hurdle>
Use critical only when the project cannot continue without a human decision.";

fn task(phase: Phase) -> &'static str {
    match phase {
        Phase::Planning => {
            "Produce a development plan a developer can follow. Cover:\n\
             1. Project structure and architecture\n\
             2. Technology stack\n\
             3. File layout\n\
             4. Key features and components\n\
             5. Dependencies\n\
             6. Step-by-step implementation roadmap\n\
             7. Security considerations\n\
             8. Testing strategy (unit, integration, end-to-end)"
        }
        Phase::Development => {
            "Implement the project according to the plan in the context above. \
             Start with the smallest version that works end to end, then add error \
             handling and features one at a time. Keep the code simple, avoid \
             duplication, and include unit tests for critical functions."
        }
        Phase::Review => {
            "Review the implementation in the context above. Report correctness \
             problems, security issues, maintainability concerns and missing tests, \
             each with a concrete suggested fix. Finish with an overall verdict."
        }
        Phase::Testing => {
            "Write and run tests for the implementation in the context above. \
             Report results and finish with a single line: either \
             \"ALL TESTS PASSED\" or \"TESTS FAILED\" followed by the failing cases."
        }
        Phase::PrCreation => {
            "Write the pull request description for this work: a summary of what was \
             built, notable design decisions, review outcome and test status. \
             Use Markdown. Output only the description."
        }
        Phase::PrMerge => {
            "Confirm the pull request is ready to merge. List any remaining \
             blockers, or state that it is ready."
        }
    }
}

/// Build the generation prompt for `phase`.
pub fn phase_prompt(phase: Phase, manifesto: &str, context: &str) -> String {
    let role = phase.producer();
    let mut prompt = format!(
        "You are the {role} on an autonomous software team. Your job in this phase is to {goal}.\n\n\
         ## Project manifesto\n\n{manifesto}\n",
        role = role,
        goal = phase.describe(),
        manifesto = truncate_to_tokens(manifesto.trim(), MAX_MANIFESTO_TOKENS),
    );

    if !context.trim().is_empty() {
        prompt.push_str("\n## Work so far\n\n");
        prompt.push_str(context.trim_end());
        prompt.push('\n');
    }

    prompt.push_str(&format!("\n## Task: {}\n\n{}\n\n", phase, task(phase)));
    prompt.push_str(HURDLE_INSTRUCTIONS);
    prompt.push('\n');
    prompt
}

/// Title for the change request: the manifesto's first line, shortened.
pub fn pr_title(manifesto: &str) -> String {
    let first = manifesto
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or("Project implementation");

    if first.chars().count() <= MAX_TITLE_CHARS {
        first.to_string()
    } else {
        let cut: String = first.chars().take(MAX_TITLE_CHARS - 3).collect();
        format!("{}...", cut.trim_end())
    }
}

/// Body for the change request. Hurdle markers are left out.
pub fn pr_body(description: &str, tests_passed: bool) -> String {
    let status = if tests_passed {
        "✅ Passed"
    } else {
        "❌ Failed"
    };
    let description = strip_hurdles(description);
    if description.is_empty() {
        format!("Implementation of project from manifesto.\n\nTest Status: {}", status)
    } else {
        format!("{}\n\n---\nTest Status: {}", description, status)
    }
}

/// Feedback appended to the brief when a pass leaves work outstanding.
pub fn iteration_feedback(iteration: u32, gaps: &[String]) -> String {
    let mut section = format!(
        "\n\n## Feedback from iteration {}\n\nThe previous pass did not finish the job. Address these first:\n",
        iteration
    );
    for gap in gaps {
        section.push_str("\n- ");
        section.push_str(gap);
    }
    section.push('\n');
    section
}

/// First `max_chars` characters of `text` on one line.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}

/// Snapshot shown to an approver, bounded in size.
pub fn snapshot(label: &str, content: &str) -> String {
    format!("{}\n\n{}", label, truncate_to_tokens(content.trim(), 500))
}
