//! Fuzz target for change record decoding.
//!
//! Arbitrary bytes must never panic the decoder, and whatever decodes must
//! survive event decoding and the filter stage.

#![no_main]

use cdc_cache_sync::memory::MemoryStore;
use cdc_cache_sync::{Endpoint, Event, EventPipeline, Operation, RawRecord, Rule, TableRef};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let Ok(record) = RawRecord::from_json(data) else {
        return;
    };

    let event = Event::decode(&record);
    assert_eq!(event.key, record.dedup_key());
    assert_eq!(Operation::parse(event.operation.as_str()), event.operation);

    let rule = Rule::new("r1", TableRef::new("customer"), &["id"]);
    let pipeline = EventPipeline::new(
        Arc::new(rule),
        Arc::new(MemoryStore::new(Endpoint::new("mem://fuzz"))),
    );
    if event.schema_change {
        assert!(pipeline.filter(&event).is_some());
    }
});
