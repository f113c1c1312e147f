use canonry::{
    AnalysisResult, CancelToken, Canonry, CanonryConfig, CanonryError, Candidate, ConflictError,
    EntityKind, EntryId, MatchVia, OwnerId, Resolution,
};

fn canonry() -> Canonry {
    Canonry::in_memory(CanonryConfig::default()).unwrap()
}

fn analysis(json: &str) -> AnalysisResult {
    serde_json::from_str(json).unwrap()
}

#[test]
fn mario_second_mention_adds_evidence_not_entity() {
    let canonry = canonry();
    let owner = OwnerId::new();
    let cancel = CancelToken::new();

    let first_entry = EntryId::new();
    let first = canonry
        .ingest_entry(
            owner,
            first_entry,
            &analysis(r#"{"concepts": [{"label": "Mario", "type": "person", "snippet": "dinner with Mario"}]}"#),
            &cancel,
        )
        .unwrap();
    let Resolution::Created { entity_id } = first.candidates[0].resolution else {
        panic!("expected a new entity, got {:?}", first.candidates[0].resolution);
    };
    let entity = canonry.entity(entity_id).unwrap().unwrap();
    assert_eq!(entity.anchor_key, "person:mario");

    let second_entry = EntryId::new();
    let second = canonry
        .ingest_entry(
            owner,
            second_entry,
            &analysis(r#"{"concepts": [{"label": "mario", "type": "Person"}]}"#),
            &cancel,
        )
        .unwrap();
    assert_eq!(
        second.candidates[0].resolution,
        Resolution::MatchedExisting {
            entity_id,
            via: MatchVia::Anchor
        }
    );
    assert!(second.candidates[0].evidence_appended);

    let stores = canonry.stores();
    assert_eq!(stores.canonical.entities_for_owner(owner).unwrap().len(), 1);
    let evidence = stores.canonical.evidence(entity_id).unwrap();
    assert_eq!(evidence.len(), 2);
    assert_eq!(
        stores.canonical.entries_referencing(entity_id).unwrap(),
        [first_entry, second_entry].into_iter().collect()
    );
}

#[test]
fn same_normalized_label_resolves_to_same_id() {
    let canonry = canonry();
    let owner = OwnerId::new();
    let cancel = CancelToken::new();

    let labels = ["Café Nero", "cafe nero", "  CAFÉ   NERO!  "];
    let ids: Vec<_> = labels
        .iter()
        .map(|label| {
            let entry = EntryId::new();
            canonry
                .ingest_candidates(
                    owner,
                    entry,
                    vec![Candidate::new(*label, EntityKind::Place, entry)],
                    &cancel,
                )
                .unwrap()
                .entity_ids()[0]
        })
        .collect();
    assert!(ids.iter().all(|id| *id == ids[0]));

    // Re-ingesting the same entry appends nothing new.
    let entry = EntryId::new();
    let candidates = vec![Candidate::new("Cafe Nero", EntityKind::Place, entry)];
    canonry
        .ingest_candidates(owner, entry, candidates.clone(), &cancel)
        .unwrap();
    let again = canonry
        .ingest_candidates(owner, entry, candidates, &cancel)
        .unwrap();
    assert!(!again.candidates[0].evidence_appended);
    assert_eq!(
        canonry.stores().canonical.evidence(ids[0]).unwrap().len(),
        4
    );
}

#[test]
fn owners_do_not_share_entities() {
    let canonry = canonry();
    let cancel = CancelToken::new();
    let (alice, bob) = (OwnerId::new(), OwnerId::new());

    let ingest = |owner| {
        let entry = EntryId::new();
        canonry
            .ingest_candidates(
                owner,
                entry,
                vec![Candidate::new("Roma", EntityKind::Place, entry)],
                &cancel,
            )
            .unwrap()
            .entity_ids()[0]
    };
    assert_ne!(ingest(alice), ingest(bob));
}

#[test]
fn redirect_chain_resolves_to_head_and_rejects_cycle() {
    let canonry = canonry();
    let owner = OwnerId::new();
    let cancel = CancelToken::new();

    let entry = EntryId::new();
    let ids = canonry
        .ingest_candidates(
            owner,
            entry,
            vec![
                Candidate::new("Anna", EntityKind::Person, entry),
                Candidate::new("Bea", EntityKind::Person, entry),
                Candidate::new("Carla", EntityKind::Person, entry),
            ],
            &cancel,
        )
        .unwrap()
        .entity_ids();
    let (a, b, c) = (ids[0], ids[1], ids[2]);

    let store = &canonry.stores().canonical;
    store.merge(a, b).unwrap();
    store.merge(b, c).unwrap();

    assert_eq!(canonry.resolve_canonical(a).unwrap(), c);
    assert_eq!(canonry.resolve_canonical(c).unwrap(), c);
    let head = canonry.resolve_canonical(a).unwrap();
    assert_eq!(canonry.resolve_canonical(head).unwrap(), head);

    let err = store.merge(c, a).unwrap_err();
    assert!(matches!(
        err,
        CanonryError::Conflict(ConflictError::RedirectCycle { .. })
    ));
    assert_eq!(canonry.resolve_canonical(a).unwrap(), c);

    // Later mentions of a merged-away name land on the head.
    let entry = EntryId::new();
    let out = canonry
        .ingest_candidates(
            owner,
            entry,
            vec![Candidate::new("anna", EntityKind::Person, entry)],
            &cancel,
        )
        .unwrap();
    assert_eq!(out.entity_ids(), vec![c]);
}

#[test]
fn cancelled_ingest_keeps_nothing_after_cancel_point() {
    let canonry = canonry();
    let owner = OwnerId::new();
    let cancel = CancelToken::new();
    cancel.cancel();

    let entry = EntryId::new();
    let err = canonry
        .ingest_candidates(
            owner,
            entry,
            vec![Candidate::new("Luca", EntityKind::Person, entry)],
            &cancel,
        )
        .unwrap_err();
    assert!(matches!(err, CanonryError::Cancelled));
    assert!(canonry
        .stores()
        .canonical
        .entities_for_owner(owner)
        .unwrap()
        .is_empty());
}
