// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Prompt composition for delegate runs and metacognitive iterations.

/// Delegate system prompt: the profile's prompt, optionally followed by the
/// host's current-conditions block.
pub fn delegate_system_prompt(profile_prompt: &str, conditions: Option<&str>) -> String {
    match conditions {
        Some(c) if !c.is_empty() => format!("{profile_prompt}\n\n{c}"),
        _ => profile_prompt.to_string(),
    }
}

/// Delegate user message: the task, optionally followed by caller guidance.
pub fn delegate_user_message(task: &str, guidance: &str) -> String {
    if guidance.is_empty() {
        task.to_string()
    } else {
        format!("{task}\n\nGuidance: {guidance}")
    }
}

/// The metacognitive prompt template.  Each iteration is independent: the
/// only carried context is the state file content passed in here.
pub fn metacognitive_prompt(state: &str, supervisor: bool) -> String {
    let role = if supervisor {
        "This is a SUPERVISOR iteration: you are running on a stronger model. \
         Review the recent iteration log critically, correct drift in the \
         state notes, and adjust the cadence if the loop is sleeping too \
         much or too little."
    } else {
        "This is a routine iteration. Review your state, decide whether \
         anything needs attention, and keep your notes current."
    };
    let state_block = if state.is_empty() {
        "(state file is empty — this may be your first iteration)".to_string()
    } else {
        state.to_string()
    };
    format!(
        "You are the metacognitive loop of a long-running assistant. You wake \
         periodically, reflect, and go back to sleep.\n\n{role}\n\n\
         Your persistent state file:\n\n---\n{state_block}\n---\n\n\
         When you are done, call `update_metacognitive_state` with the full \
         new state file content if it should change, and `set_next_sleep` \
         with how many seconds to sleep before the next iteration. \
         Then reply with a one-line summary of what you did."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_appends_conditions() {
        let p = delegate_system_prompt("Base prompt.", Some("It is 14:02 on Saturday."));
        assert_eq!(p, "Base prompt.\n\nIt is 14:02 on Saturday.");
    }

    #[test]
    fn system_prompt_without_conditions_is_bare() {
        assert_eq!(delegate_system_prompt("Base.", None), "Base.");
        assert_eq!(delegate_system_prompt("Base.", Some("")), "Base.");
    }

    #[test]
    fn user_message_appends_guidance() {
        assert_eq!(
            delegate_user_message("Check the light", "prefer get_state"),
            "Check the light\n\nGuidance: prefer get_state"
        );
        assert_eq!(delegate_user_message("Check the light", ""), "Check the light");
    }

    #[test]
    fn metacognitive_prompt_marks_supervisor_iterations() {
        let normal = metacognitive_prompt("notes", false);
        let supervisor = metacognitive_prompt("notes", true);
        assert!(supervisor.contains("SUPERVISOR"));
        assert!(!normal.contains("SUPERVISOR"));
        assert!(normal.contains("notes"));
    }

    #[test]
    fn metacognitive_prompt_handles_empty_state() {
        let p = metacognitive_prompt("", false);
        assert!(p.contains("first iteration"));
    }
}
