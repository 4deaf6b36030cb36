#![forbid(unsafe_code)]

use crate::state::SessionState;

/// Queued indices (other than `index`) whose source text is byte-identical to `index`'s.
pub fn duplicates_of(state: &SessionState, index: usize) -> Vec<usize> {
    let Some(source) = state.item(index).map(|i| i.original_text.as_str()) else { return Vec::new() };
    state
        .queue
        .iter()
        .filter(|q| q.index != index)
        .filter(|q| state.item(q.index).map(|i| i.original_text == source).unwrap_or(false))
        .map(|q| q.index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrivener_core::WorkItem;

    fn item(batch_index: usize, text: &str) -> WorkItem {
        WorkItem {
            batch_index,
            record_index: 0,
            form_id: format!("{:08X}", batch_index),
            record_type: "MISC".into(),
            subrecord_type: "FULL".into(),
            original_text: text.into(),
        }
    }

    #[test]
    fn matches_exact_bytes_only() {
        let s = SessionState::new(
            vec![item(0, "Sword"), item(1, "Sword"), item(2, "sword"), item(3, "Sword "), item(4, "Sword")],
            Vec::new(),
        );
        assert_eq!(duplicates_of(&s, 0), vec![1, 4]);
        assert!(duplicates_of(&s, 2).is_empty());
        assert!(duplicates_of(&s, 99).is_empty());
    }
}
