diesel::table! {
    room_state (room_id) {
        room_id -> Text,
        voice_channel_id -> Nullable<Text>,
        notify_channel_id -> Nullable<Text>,
        current_track -> Nullable<Text>,
        is_paused -> Bool,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    queue_tracks (id) {
        id -> Nullable<Integer>,
        room_id -> Text,
        position -> Integer,
        track -> Text,
    }
}

diesel::table! {
    history_tracks (id) {
        id -> Nullable<Integer>,
        room_id -> Text,
        title -> Text,
        canonical_url -> Text,
        duration -> Nullable<Integer>,
        thumbnail -> Nullable<Text>,
        played_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(room_state, queue_tracks, history_tracks);
