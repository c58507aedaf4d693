//! LLM prompts for answer generation and answer judging.

/// Collection of prompts used by the LLM-backed collaborators.
pub struct Prompts;

impl Prompts {
    /// System prompt for grounded answer generation.
    pub fn system_rag_assistant() -> &'static str {
        "You are a precise assistant. Answer only from the provided context. If the context does not contain the answer, say that you do not know."
    }

    /// Prompt to answer a question from retrieved context.
    pub fn rag_answer() -> &'static str {
        r#"Use the context below to answer the question.

Context:
{context}

Question: {question}

Answer in at most three sentences. Do not add information that is not in the context."#
    }

    /// Prompt to rate how well an answer addresses a question.
    pub fn answer_relevance_judge() -> &'static str {
        r#"You are an expert judge evaluating the answer produced by a question answering system.

Question: {question}

Answer:
{answer}
{reference}

Rate the answer:
1. Relevance: How well does the answer address the question? (1=not at all, 5=completely and correctly)

Respond in JSON format:
{
    "relevance": <1-5>,
    "explanation": "<brief explanation>"
}

Respond with only the JSON, no other text."#
    }

    /// Fill the answer prompt.
    pub fn render_rag_answer(question: &str, context: &str) -> String {
        Self::rag_answer()
            .replace("{context}", context)
            .replace("{question}", question)
    }

    /// Fill the judge prompt; the reference section is omitted when absent.
    pub fn render_answer_relevance_judge(
        question: &str,
        answer: &str,
        reference: Option<&str>,
    ) -> String {
        let reference_section = reference
            .map(|r| format!("\nReference Answer: {}", r))
            .unwrap_or_default();

        Self::answer_relevance_judge()
            .replace("{question}", question)
            .replace("{answer}", answer)
            .replace("{reference}", &reference_section)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_are_not_empty() {
        assert!(!Prompts::system_rag_assistant().is_empty());
        assert!(!Prompts::rag_answer().is_empty());
        assert!(!Prompts::answer_relevance_judge().is_empty());
    }

    #[test]
    fn test_render_rag_answer() {
        let prompt = Prompts::render_rag_answer("Why?", "Because.");
        assert!(prompt.contains("Question: Why?"));
        assert!(prompt.contains("Because."));
        assert!(!prompt.contains("{context}"));
    }

    #[test]
    fn test_render_judge_without_reference() {
        let prompt = Prompts::render_answer_relevance_judge("Q", "A", None);
        assert!(!prompt.contains("Reference Answer"));
        assert!(!prompt.contains("{reference}"));

        let prompt = Prompts::render_answer_relevance_judge("Q", "A", Some("R"));
        assert!(prompt.contains("Reference Answer: R"));
    }
}
