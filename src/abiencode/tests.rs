use super::{
    as_bytes, to_bytes, to_hash,
    types::{Address, Bytes32, Hash, U256},
    to_writer, Error, Writer,
};
use core::fmt::Debug;
use serde::Serialize;

/// Compares every written slot against the next line of the expectation.
struct AssertWriter<'a, I>
where
    I: Iterator<Item = &'a str>,
{
    expected_iter: I,
}

struct Slot<'a>(&'a [u8]);

impl<'a> Debug for Slot<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for b in self.0 {
            f.write_fmt(format_args!("{:02x}", b))?;
        }
        Ok(())
    }
}

impl<'a> PartialEq for Slot<'a> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<'a, I> Writer for AssertWriter<'a, I>
where
    I: Iterator<Item = &'a str>,
{
    fn write(&mut self, slot: &[u8]) {
        match self.expected_iter.next() {
            Some(expected) => {
                assert_eq!(slot.len(), 32, "Each slot should have 32 bytes.");
                let expected = hex::decode(expected).unwrap();
                assert_eq!(
                    Slot(slot),
                    Slot(expected.as_slice()),
                    "slot did not match the expected value"
                );
            }
            None => panic!("Expected end of data, got {:?}", Slot(slot)),
        }
    }
}

/// Each non-empty line of `expected` starts with a 32 byte hex slot,
/// anything after it is a comment.
pub fn serialize_and_compare<T>(value: &T, expected: &str)
where
    T: Serialize,
{
    let mut writer = AssertWriter {
        expected_iter: expected
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| &line[..64]),
    };
    to_writer(value, &mut writer).unwrap();

    let next = writer.expected_iter.next();
    assert_eq!(next, None, "there are less slots than expected.");
}

#[derive(Serialize)]
struct Static {
    a: u64,
    b: bool,
    c: Address,
}

#[test]
fn static_struct_is_inlined() {
    let value = Static {
        a: 7,
        b: true,
        c: Address([0x11; 20]),
    };
    serialize_and_compare(
        &value,
        "
        0000000000000000000000000000000000000000000000000000000000000007 a
        0000000000000000000000000000000000000000000000000000000000000001 b
        0000000000000000000000001111111111111111111111111111111111111111 c
        ",
    );
}

#[derive(Serialize)]
struct WithBytes {
    a: u64,
    #[serde(with = "as_bytes")]
    data: Vec<u8>,
}

#[test]
fn dynamic_bytes_go_to_the_tail() {
    let value = WithBytes {
        a: 1,
        data: vec![0xaa, 0xbb],
    };
    serialize_and_compare(
        &value,
        "
        0000000000000000000000000000000000000000000000000000000000000020 offset of struct
        0000000000000000000000000000000000000000000000000000000000000001 a
        0000000000000000000000000000000000000000000000000000000000000040 offset of data
        0000000000000000000000000000000000000000000000000000000000000002 data length
        aabb000000000000000000000000000000000000000000000000000000000000 data
        ",
    );
}

#[test]
fn empty_bytes_only_write_the_length() {
    let value = WithBytes { a: 1, data: vec![] };
    serialize_and_compare(
        &value,
        "
        0000000000000000000000000000000000000000000000000000000000000020 offset of struct
        0000000000000000000000000000000000000000000000000000000000000001 a
        0000000000000000000000000000000000000000000000000000000000000040 offset of data
        0000000000000000000000000000000000000000000000000000000000000000 data length
        ",
    );
}

#[derive(Serialize)]
struct Item {
    destination: Bytes32,
    amount: U256,
}

#[derive(Serialize)]
struct Items {
    items: Vec<Item>,
}

#[test]
fn array_of_static_structs() {
    let value = Items {
        items: vec![
            Item {
                destination: Bytes32([0xd1; 32]),
                amount: 5.into(),
            },
            Item {
                destination: Bytes32([0xd2; 32]),
                amount: 6.into(),
            },
        ],
    };
    serialize_and_compare(
        &value,
        "
        0000000000000000000000000000000000000000000000000000000000000020 offset of struct
        0000000000000000000000000000000000000000000000000000000000000020 offset of items
        0000000000000000000000000000000000000000000000000000000000000002 length
        d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1 items[0].destination
        0000000000000000000000000000000000000000000000000000000000000005 items[0].amount
        d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2 items[1].destination
        0000000000000000000000000000000000000000000000000000000000000006 items[1].amount
        ",
    );
}

#[derive(Serialize)]
struct Nested {
    first: Items,
    second: u8,
}

#[test]
fn nested_dynamic_struct_uses_offsets() {
    let value = Nested {
        first: Items {
            items: vec![Item {
                destination: Bytes32([0xd1; 32]),
                amount: 1.into(),
            }],
        },
        second: 9,
    };
    serialize_and_compare(
        &value,
        "
        0000000000000000000000000000000000000000000000000000000000000020 offset of struct
        0000000000000000000000000000000000000000000000000000000000000040 offset of first
        0000000000000000000000000000000000000000000000000000000000000009 second
        0000000000000000000000000000000000000000000000000000000000000020 first: offset of items
        0000000000000000000000000000000000000000000000000000000000000001 length
        d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1 items[0].destination
        0000000000000000000000000000000000000000000000000000000000000001 items[0].amount
        ",
    );
}

#[test]
fn hash_of_a_zero_slot() {
    #[derive(Serialize)]
    struct Zero {
        value: u64,
    }
    let expected = Hash(
        <[u8; 32]>::try_from(
            hex::decode("290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563")
                .unwrap()
                .as_slice(),
        )
        .unwrap(),
    );
    assert_eq!(to_hash(&Zero { value: 0 }).unwrap(), expected);
}

#[test]
fn unrepresentable_types_are_rejected() {
    #[derive(Serialize)]
    struct Float {
        value: f32,
    }
    assert_eq!(
        to_bytes(&Float { value: 1.0 }),
        Err(Error::TypeNotRepresentable("f32"))
    );

    #[derive(Serialize)]
    enum Kind {
        A,
    }
    #[derive(Serialize)]
    struct WithEnum {
        kind: Kind,
    }
    assert!(to_bytes(&WithEnum { kind: Kind::A }).is_err());
}
