//! Prompt sent to the model for each paragraph.

/// Default subject matter named in the prompt.
pub const DEFAULT_DOMAIN: &str = "financial reports";

/// Build the judgement prompt for `target`, with `context` embedded as a JSON array.
pub fn build_prompt(domain: &str, context: &[String], target: &str) -> String {
    let context_json = serde_json::to_string(context).unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"You are an expert at creating datasets for Supervised Fine-Tuning (SFT) from {domain}.

Task:
1. Analyze the 'Target Paragraph'.
2. Determine if it contains valuable knowledge suitable for a Q&A dataset. Skip if it is:
   - A table of contents, index, or list of figures.
   - A legal disclaimer or copyright notice.
   - A header, footer, or page number artifact.
   - Too fragmented or lacks semantic meaning.
3. If valid:
   - Generate a specific Question that the 'Target Paragraph' answers.
   - The Answer should be the 'Target Paragraph'.
   - However, if the 'Target Paragraph' relies on the 'Context Paragraphs' to be fully understood (e.g., it starts with "It also..."), ENHANCE the Answer by incorporating necessary details from the Context.
   - The Answer must be self-contained.

Context Paragraphs (Previous):
{context_json}

Target Paragraph (Current):
{target}

Output JSON ONLY in this format:
{{
    "valid": true/false,
    "question": "The generated question",
    "answer": "The enhanced answer"
}}
"#
    )
}
