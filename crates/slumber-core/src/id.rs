use crate::define_id_type;

define_id_type!(
    /// Account identity
    struct UserId
);

define_id_type!(
    /// A posted sleep record
    struct RecordId
);

define_id_type!(
    /// A single follow edge
    struct FollowId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_and_parse() {
        let id = UserId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!("42".parse::<UserId>().expect("valid"), id);
        assert!("x42".parse::<RecordId>().is_err());
    }

    #[test]
    fn ids_serialize_as_plain_numbers() {
        assert_eq!(
            serde_json::to_string(&FollowId::new(7)).expect("serializes"),
            "7"
        );
        assert_eq!(
            serde_json::from_str::<RecordId>("9").expect("deserializes"),
            RecordId::new(9)
        );
    }
}
