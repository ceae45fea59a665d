//! Integration test: field layout produced by a configured engine and
//! value encoding through it.

use csp_common::consts::{OBJ_ACTUAL_POSITION, OBJ_CONTROL_WORD, OBJ_STATUS_WORD, OBJ_TARGET_POSITION};
use csp_common::device::ObjectId;
use csp_engine::image::{FieldKind, ImageError};

use super::{engine, two_drives};

#[test]
fn registered_fields_are_disjoint_and_inside_the_image() {
    let cfg = two_drives();
    let e = engine(&cfg);
    let fields = e.registry().fields();
    assert_eq!(fields.len(), 8);

    for (i, a) in fields.iter().enumerate() {
        assert!(a.end() <= e.image().len(), "{a:?} exceeds image");
        for b in &fields[i + 1..] {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }
}

#[test]
fn csp_fields_have_expected_kinds() {
    let cfg = two_drives();
    let e = engine(&cfg);
    for device in 0..2 {
        let kind = |index| {
            e.registry()
                .lookup(device, ObjectId::new(index, 0))
                .unwrap()
                .kind()
        };
        assert_eq!(kind(OBJ_CONTROL_WORD), FieldKind::U16);
        assert_eq!(kind(OBJ_TARGET_POSITION), FieldKind::I32);
        assert_eq!(kind(OBJ_STATUS_WORD), FieldKind::U16);
        assert_eq!(kind(OBJ_ACTUAL_POSITION), FieldKind::I32);
    }
    assert!(e.registry().lookup(2, ObjectId::new(OBJ_CONTROL_WORD, 0)).is_none());
}

#[test]
fn values_survive_the_image() {
    let cfg = two_drives();
    let e = engine(&cfg);
    let axis = e.axes()[1];
    let mut image = e.registry().finalize();

    image.write(&axis.control_word, 0x000F).unwrap();
    image.write(&axis.target_position, -123_456).unwrap();
    assert_eq!(image.read_u16(&axis.control_word).unwrap(), 0x000F);
    assert_eq!(image.read_i32(&axis.target_position).unwrap(), -123_456);

    image.write(&axis.target_position, i32::MIN as i64).unwrap();
    assert_eq!(image.read(&axis.target_position).unwrap(), i32::MIN as i64);

    // Little-endian on the wire.
    let at = axis.control_word.byte_offset();
    assert_eq!(&image.as_slice()[at..at + 2], &[0x0F, 0x00]);
}

#[test]
fn out_of_range_write_leaves_image_untouched() {
    let cfg = two_drives();
    let e = engine(&cfg);
    let axis = e.axes()[0];
    let mut image = e.registry().finalize();
    image.write(&axis.control_word, 0x0006).unwrap();
    image.write(&axis.target_position, 42).unwrap();
    let before = image.as_slice().to_vec();

    for (field, value) in [
        (axis.control_word, 70_000),
        (axis.control_word, -1),
        (axis.target_position, i32::MAX as i64 + 1),
    ] {
        let err = image.write(&field, value).unwrap_err();
        assert!(matches!(err, ImageError::FieldRange { value: v, .. } if v == value));
        assert_eq!(image.as_slice(), &before[..]);
    }
}

#[test]
fn image_matches_domain_size() {
    let cfg = two_drives();
    let e = engine(&cfg);
    assert_eq!(e.image().len(), e.registry().required_size());
    assert_eq!(e.image().len(), 24);
}
