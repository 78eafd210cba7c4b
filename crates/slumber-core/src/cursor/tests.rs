use proptest::prelude::*;

use super::*;

#[test]
fn round_trip_simple() {
    let cursor = Cursor::new(Timestamp::from_millis(1_700_000_000_000), 17u64);
    let token = cursor.encode();
    assert_eq!(Cursor::decode(&token), Some(cursor));
}

#[test]
fn garbage_decodes_to_none() {
    for token in ["", "not a cursor", "!!!!", "AAAA", "eyJpZCI6MX0"] {
        assert_eq!(Cursor::decode(token), None, "token: {token:?}");
    }
}

#[test]
fn tampered_token_decodes_to_none() {
    let token = Cursor::new(Timestamp::from_millis(5), 9u64).encode();
    let mut bytes = BASE64URL_NOPAD.decode(token.as_bytes()).expect("valid");
    bytes[15] ^= 1;
    let tampered = BASE64URL_NOPAD.encode(&bytes);

    assert_eq!(Cursor::decode(&tampered), None);
}

#[test]
fn absent_token_is_no_cursor() {
    assert_eq!(Cursor::decode_opt(None), None);
}

#[test]
fn next_cursor_ends_on_short_page() {
    let rows = vec![(Timestamp::from_millis(3), 3u64), (Timestamp::from_millis(2), 2)];
    let key = |row: &(Timestamp, u64)| Cursor::new(row.0, row.1);

    assert_eq!(next_cursor(&rows, 3, key), None);
    assert_eq!(next_cursor::<(Timestamp, u64)>(&[], 1, key), None);

    let token = next_cursor(&rows, 2, key).expect("full page has a next cursor");
    assert_eq!(
        Cursor::decode(&token),
        Some(Cursor::new(Timestamp::from_millis(2), 2u64))
    );
}

proptest! {
    #[test]
    fn decode_inverts_encode(ts in any::<u64>(), id in any::<u64>()) {
        let cursor = Cursor::new(Timestamp::from_millis(ts), id);
        prop_assert_eq!(Cursor::decode(&cursor.encode()), Some(cursor));
    }

    #[test]
    fn arbitrary_strings_never_panic(s in ".*") {
        let _ = Cursor::decode(&s);
    }

    #[test]
    fn short_pages_never_continue(len in 0usize..20, extra in 1usize..5) {
        let rows: Vec<u64> = (0..len as u64).collect();
        let key = |id: &u64| Cursor::new(Timestamp::ZERO, *id);
        prop_assert_eq!(next_cursor(&rows, len + extra, key), None);
    }
}
