#![forbid(unsafe_code)]

use scrivener_core::{Provenance, RowUpdate, StringRecord, TranslationStatus};
use scrivener_store::EditorStore;

fn rows() -> Vec<StringRecord> {
    let mk = |index: u32, text: &str, translated: &str, status: TranslationStatus| StringRecord {
        form_id: "0001A2B3".into(),
        editor_id: Some("DLC1Item".into()),
        record_type: "BOOK".into(),
        subrecord_type: "DESC".into(),
        index,
        original_text: text.into(),
        translated_text: translated.into(),
        translation_status: status,
    };
    vec![
        mk(0, "Iron Sword", "Iron Sword", TranslationStatus::Untranslated),
        mk(1, "Iron Sword", "Iron Sword", TranslationStatus::Untranslated),
        mk(2, "Steel Dagger", "钢匕首", TranslationStatus::Persisted),
        mk(3, "Sothis", "索希斯", TranslationStatus::Manual),
    ]
}

#[test]
fn n_edits_then_n_undos_restore_everything() {
    let original = rows();
    let mut store = EditorStore::with_history_cap(50);
    store.open_session("mod.esp", original.clone()).unwrap();
    // Row 3 carries an unsaved manual edit from before the batch.
    store.edit_row("mod.esp", &original[3].key(), "索西斯").unwrap();
    store.edit_row("mod.esp", &original[3].key(), "索希斯").unwrap();
    let baseline_rows = store.rows("mod.esp").unwrap().to_vec();
    let baseline_pending = store.pending("mod.esp");
    let depth = store.undo_depth("mod.esp");

    let mut edits = 0;
    store
        .apply_updates(
            "mod.esp",
            &[
                RowUpdate { key: original[0].key(), translated_text: "铁剑".into(), provenance: Provenance::Ai, expanded: false },
                RowUpdate { key: original[1].key(), translated_text: "铁剑".into(), provenance: Provenance::Ai, expanded: true },
            ],
        )
        .unwrap();
    edits += 1;
    store.edit_row("mod.esp", &original[2].key(), "钢制匕首").unwrap();
    edits += 1;
    store
        .apply_updates(
            "mod.esp",
            &[RowUpdate { key: original[3].key(), translated_text: "索斯".into(), provenance: Provenance::Ai, expanded: false }],
        )
        .unwrap();
    edits += 1;
    assert_eq!(store.pending("mod.esp").len(), 4);

    for _ in 0..edits {
        assert!(store.undo("mod.esp").unwrap().is_some());
    }
    assert_eq!(store.rows("mod.esp").unwrap(), baseline_rows.as_slice());
    assert_eq!(store.pending("mod.esp"), baseline_pending);
    assert_eq!(store.undo_depth("mod.esp"), depth);
}

#[test]
fn history_cap_retains_newest() {
    let original = rows();
    let mut store = EditorStore::with_history_cap(3);
    store.open_session("s", original.clone()).unwrap();
    for n in 0..4 {
        store.edit_row("s", &original[0].key(), &format!("铁剑{}", n)).unwrap();
    }
    assert_eq!(store.undo_depth("s"), 3);
    while store.undo("s").unwrap().is_some() {}
    // The first edit was evicted, so the row stops at its result.
    assert_eq!(store.row("s", &original[0].key()).unwrap().translated_text, "铁剑0");
}

#[test]
fn commands_serialize_with_snapshots() {
    let original = rows();
    let mut store = EditorStore::default();
    store.open_session("s", original.clone()).unwrap();
    store.edit_row("s", &original[0].key(), "铁剑").unwrap();
    let cmd = store.undo("s").unwrap().unwrap();
    let v = serde_json::to_value(&cmd).unwrap();
    assert_eq!(v["kind"], "single");
    assert_eq!(v["session_id"], "s");
    assert_eq!(v["records"][0]["record_id"], "0001A2B3|BOOK|DESC|0");
    assert_eq!(v["records"][0]["before"]["translation_status"], "untranslated");
    assert_eq!(v["records"][0]["after"]["translation_status"], "manual");
}

#[test]
fn unsaved_rows_start_pending_and_survive_undo() {
    let mut original = rows();
    original[0].translated_text = "铁剑".into();
    original[0].translation_status = TranslationStatus::Ai;
    let mut store = EditorStore::default();
    store.open_session("mod.esp", original.clone()).unwrap();
    let before = store.pending("mod.esp");
    assert_eq!(before, vec![original[0].record_id(), original[3].record_id()]);

    store.edit_row("mod.esp", &original[0].key(), "铁之剑").unwrap();
    store.edit_row("mod.esp", &original[2].key(), "钢制匕首").unwrap();
    store.undo("mod.esp").unwrap();
    store.undo("mod.esp").unwrap();
    assert_eq!(store.rows("mod.esp").unwrap(), original.as_slice());
    assert_eq!(store.pending("mod.esp"), before);

    // The loaded ai row is saved along with the rest.
    let saved = store.pending_rows("mod.esp").unwrap();
    assert!(saved.iter().any(|r| r.translated_text == "铁剑"));
}
