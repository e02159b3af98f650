//! Cross-mapping lifecycle tests for named segments.
//!
//! These run producer and consumer roles inside one process; distinct
//! mappings of the same object exercise the same kernel paths two
//! processes would.

use std::time::Duration;

use shmbus::name::generate_name;
use shmbus::segment::{Editor, Owner, Segment, Viewer};
use shmbus::Error;

#[test]
fn creator_byte_survives_creator_drop() {
    // Create a one-byte segment, store 0x2a.
    let name = generate_name();
    let creator = Segment::<Owner>::create(name.clone(), 1).unwrap();
    creator.set_byte(0, 0x2a);

    // A peer opens it and reads the byte.
    let accessor = Segment::<Viewer>::open(&*name).unwrap();
    assert_eq!(accessor.byte(0), 0x2a);

    // Dropping the creator unlinks the name, but the accessor's mapping
    // keeps the bytes alive.
    drop(creator);
    assert_eq!(accessor.byte(0), 0x2a);

    // The name is gone from the host namespace; the object itself is
    // released by the kernel once the accessor unmaps.
    assert!(matches!(
        Segment::<Viewer>::open_timeout(name, Duration::from_millis(60)),
        Err(Error::ObjectNotFoundWithin(_))
    ));
}

#[test]
fn creator_and_accessor_agree_on_identity() {
    let creator = Segment::<Owner>::create(generate_name(), 8192).unwrap();
    let viewer = Segment::<Viewer>::open(creator.name()).unwrap();
    let editor = Segment::<Editor>::open(creator.name()).unwrap();

    assert_eq!(creator.name(), viewer.name());
    assert_eq!(creator.len(), viewer.len());
    assert_eq!(creator.len(), editor.len());
    assert_eq!(viewer, creator);
    assert_eq!(editor, viewer);
}

#[test]
fn editor_mapping_is_bidirectional() {
    let creator = Segment::<Owner>::create(generate_name(), 4096).unwrap();
    let editor = Segment::<Editor>::open(creator.name()).unwrap();

    creator.set_byte(0, 1);
    assert_eq!(editor.byte(0), 1);

    editor.set_byte(4095, 2);
    assert_eq!(creator.byte(4095), 2);
}

#[test]
fn accessor_copy_is_an_independent_mapping() {
    let creator = Segment::<Owner>::create(generate_name(), 4096).unwrap();
    creator.set_byte(99, 0x77);

    let viewer = Segment::<Viewer>::open(creator.name()).unwrap();
    let copy = viewer.try_clone().unwrap();

    assert_eq!(copy, viewer);
    assert_eq!(copy.len(), viewer.len());
    assert_eq!(copy.byte(99), 0x77);
    // Generally a different address; certainly a valid one.
    creator.set_byte(99, 0x78);
    assert_eq!(copy.byte(99), 0x78);
    assert_eq!(viewer.byte(99), 0x78);
}

#[test]
fn second_creator_for_same_name_fails() {
    let name = generate_name();
    let _creator = Segment::<Owner>::create(name.clone(), 4096).unwrap();
    assert!(matches!(
        Segment::<Owner>::create(name, 4096),
        Err(Error::NameInUse(_))
    ));
}

#[test]
fn accessor_wait_times_out_on_missing_object() {
    let start = std::time::Instant::now();
    let result = Segment::<Viewer>::open_timeout(generate_name(), Duration::from_millis(120));
    assert!(matches!(result, Err(Error::ObjectNotFoundWithin(_))));
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(120));
    assert!(waited < Duration::from_secs(5));
}

#[test]
fn malformed_names_are_rejected_before_any_syscall() {
    assert!(matches!(
        Segment::<Owner>::create("missing-slash", 1),
        Err(Error::InvalidName(_))
    ));
    assert!(matches!(
        Segment::<Owner>::create("/nested/name", 1),
        Err(Error::InvalidName(_))
    ));
    assert!(matches!(
        Segment::<Viewer>::open(format!("/{}", "x".repeat(300))),
        Err(Error::NameTooLong { .. })
    ));
}
