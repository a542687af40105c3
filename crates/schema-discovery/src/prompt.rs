//! Assembles the full analyst system prompt from a rendered schema block
//! (spec.md §4.8): role definition, schema, behavioral rules, read-only
//! instructions, non-data-question handling — capped at 12,000 characters,
//! with exceeding the cap a fatal configuration error at startup.

use subterm_error::CoreError;

const MAX_PROMPT_CHARS: usize = 12_000;

const ROLE_DEFINITION: &str = "\
You are a data analyst assistant with read-only access to a SQL database. \
Answer questions about the data by querying it through the tools you are \
given, then explain the result in plain language.";

const BEHAVIORAL_RULES: &str = "\
Rules:
- Always explain what the data means, not just the raw numbers.
- Limit result sets to 50 rows by default; state when a result was truncated.
- Cite the SQL you ran in your response.
- Prefer aggregate queries over dumping raw tables.";

const READ_ONLY_INSTRUCTIONS: &str = "\
The database connection is read-only. Do not attempt INSERT, UPDATE, DELETE, \
or DDL statements; they will fail. If a question requires a write, explain \
that the database cannot be modified through this interface.";

const NON_DATA_QUESTION_HANDLING: &str = "\
If the question is not about the data in this database, say so directly and \
decline rather than guessing or querying an unrelated table.";

/// Builds the prompt or returns `CoreError::Configuration` if the assembled
/// text exceeds [`MAX_PROMPT_CHARS`] — per spec.md, this is a fatal
/// configuration error the process must refuse to start with, not a prompt
/// to be silently truncated.
pub fn build_system_prompt(schema_text: &str) -> Result<String, CoreError> {
    let prompt = format!(
        "{ROLE_DEFINITION}\n\n\
         # Database schema\n{schema_text}\n\n\
         {BEHAVIORAL_RULES}\n\n\
         {READ_ONLY_INSTRUCTIONS}\n\n\
         {NON_DATA_QUESTION_HANDLING}\n"
    );

    if prompt.len() > MAX_PROMPT_CHARS {
        return Err(CoreError::Configuration(format!(
            "system prompt is {} chars, exceeds the {MAX_PROMPT_CHARS}-char cap \
             (schema is too large to prompt directly)",
            prompt.len()
        )));
    }
    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_all_required_sections() {
        let prompt = build_system_prompt("TABLE t\n  id INTEGER\n").unwrap();
        assert!(prompt.contains("read-only"));
        assert!(prompt.contains("Cite the SQL"));
        assert!(prompt.contains("TABLE t"));
        assert!(prompt.contains("decline rather than guessing"));
    }

    #[test]
    fn oversized_schema_is_a_configuration_error() {
        let huge_schema = "x".repeat(MAX_PROMPT_CHARS);
        let err = build_system_prompt(&huge_schema).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn boundary_at_exactly_the_cap_succeeds() {
        let base_len = build_system_prompt("").unwrap().len();
        let filler_len = MAX_PROMPT_CHARS - base_len;
        let schema_text = "x".repeat(filler_len);
        let prompt = build_system_prompt(&schema_text).unwrap();
        assert_eq!(prompt.len(), MAX_PROMPT_CHARS);
    }
}
