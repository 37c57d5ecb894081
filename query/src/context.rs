use alayasiki_core::model::{Chunk, Document};
use std::collections::HashMap;

/// Default character budget for a built context (spec.md §4.4, matches
/// `RetrievalConfig::max_context_chars`).
pub const DEFAULT_CONTEXT_BUDGET_CHARS: usize = 12_000;

fn provenance_for(document: Option<&Document>, chunk: &Chunk) -> String {
    match document {
        Some(doc) => match &doc.source {
            Some(source) => format!("{} ({}) — chunk {}", doc.title, source, chunk.chunk_index),
            None => format!("{} — chunk {}", doc.title, chunk.chunk_index),
        },
        None => format!("document {} — chunk {}", chunk.document_id, chunk.chunk_index),
    }
}

fn source_line(marker: &str, provenance: &str) -> String {
    format!("{marker} -> {provenance}\n")
}

const FUENTES_HEADER: &str = "FUENTES:\n";

/// Builds the grounded context string fed to the LLM (spec.md §4.4): each
/// included chunk is rendered as `[S#] {provenance}\n{content}\n`, chunks
/// are taken in the order given and accumulated until the next one — plus
/// its contribution to the trailing `FUENTES:` section — would push the
/// *rendered* context past `budget_chars`. `chunks_used` is 0 iff
/// `context_string` is empty, and the `[S#]` markers are stable 1-indexed
/// references shared between the inline citations and the trailing list.
pub fn build_context(
    chunks: &[Chunk],
    documents_by_id: &HashMap<String, Document>,
    budget_chars: usize,
) -> (String, usize) {
    let mut body = String::new();
    let mut sources: Vec<(String, String)> = Vec::new();
    let mut fuentes_body_len = 0usize;
    let mut chunks_used = 0usize;

    for chunk in chunks {
        let document = documents_by_id.get(&chunk.document_id);
        let provenance = provenance_for(document, chunk);
        let marker = format!("[S{}]", chunks_used + 1);
        let entry = format!("{marker} {provenance}\n{}\n", chunk.content);
        let line = source_line(&marker, &provenance);

        let projected_len =
            body.len() + entry.len() + FUENTES_HEADER.len() + fuentes_body_len + line.len();
        if projected_len > budget_chars {
            break;
        }

        body.push_str(&entry);
        fuentes_body_len += line.len();
        sources.push((marker, provenance));
        chunks_used += 1;
    }

    if chunks_used == 0 {
        return (String::new(), 0);
    }

    let mut context = body;
    context.push_str(FUENTES_HEADER);
    for (marker, provenance) in &sources {
        context.push_str(&source_line(marker, provenance));
    }

    (context, chunks_used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alayasiki_core::model::DocumentStatus;

    fn doc(id: &str, title: &str) -> Document {
        let mut document = Document::new(id, "ws-1", title);
        document.status = DocumentStatus::Ready;
        document
    }

    fn chunk(id: &str, document_id: &str, index: u32, content: &str) -> Chunk {
        Chunk::new(id, document_id, "ws-1", index, content, vec![1.0])
    }

    #[test]
    fn empty_input_yields_empty_context_and_zero_chunks_used() {
        let (context, used) = build_context(&[], &HashMap::new(), DEFAULT_CONTEXT_BUDGET_CHARS);
        assert_eq!(context, "");
        assert_eq!(used, 0);
    }

    #[test]
    fn context_contains_inline_markers_and_trailing_fuentes() {
        let documents = HashMap::from([("doc-1".to_string(), doc("doc-1", "Refund Policy"))]);
        let chunks = vec![
            chunk("c1", "doc-1", 0, "Refunds are processed within 30 days."),
            chunk("c2", "doc-1", 1, "Enterprise plans get a 60-day window."),
        ];
        let (context, used) = build_context(&chunks, &documents, DEFAULT_CONTEXT_BUDGET_CHARS);
        assert_eq!(used, 2);
        assert!(context.contains("[S1]"));
        assert!(context.contains("[S2]"));
        assert!(context.contains("FUENTES:"));
        assert!(context.contains("[S1] -> Refund Policy"));
        assert!(context.contains("[S2] -> Refund Policy"));
    }

    #[test]
    fn budget_stops_before_exceeding_and_always_includes_at_least_one_chunk() {
        let documents = HashMap::from([("doc-1".to_string(), doc("doc-1", "Doc"))]);
        let long_content = "x".repeat(100);
        let chunks = vec![
            chunk("c1", "doc-1", 0, &long_content),
            chunk("c2", "doc-1", 1, &long_content),
            chunk("c3", "doc-1", 2, &long_content),
        ];
        let (context, used) = build_context(&chunks, &documents, 160);
        assert_eq!(used, 1);
        assert!(context.len() <= 160);
    }

    #[test]
    fn markers_are_one_indexed_and_stable_across_inline_and_trailing() {
        let documents = HashMap::from([("doc-1".to_string(), doc("doc-1", "Doc"))]);
        let chunks = vec![chunk("c1", "doc-1", 0, "first"), chunk("c2", "doc-1", 1, "second")];
        let (context, _) = build_context(&chunks, &documents, DEFAULT_CONTEXT_BUDGET_CHARS);
        let first_inline = context.find("[S1]").unwrap();
        let first_trailing = context.rfind("[S1]").unwrap();
        assert!(first_trailing > first_inline);
    }

    #[test]
    fn missing_document_falls_back_to_document_id_provenance() {
        let chunks = vec![chunk("c1", "doc-missing", 0, "orphan content")];
        let (context, used) = build_context(&chunks, &HashMap::new(), DEFAULT_CONTEXT_BUDGET_CHARS);
        assert_eq!(used, 1);
        assert!(context.contains("document doc-missing"));
    }
}
