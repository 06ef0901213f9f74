// Blackbox schema - activity log tables for Diesel ORM

diesel::table! {
    users (id) {
        id -> Integer,
        username -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    projects (id) {
        id -> Integer,
        name -> Text,
        description -> Nullable<Text>,
        owner_id -> Nullable<Integer>,   // FK to users
    }
}

diesel::table! {
    sessions (id) {
        id -> Integer,
        project_id -> Integer,
        started_at -> Text,
        ended_at -> Nullable<Text>,
    }
}

diesel::table! {
    code_snippets (id) {
        id -> Integer,
        project_id -> Integer,
        filename -> Nullable<Text>,
        language -> Text,
        code -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    runs (id) {
        id -> Integer,
        session_id -> Integer,
        snippet_id -> Nullable<Integer>, // FK to code_snippets
        status -> Text,                  // pending, running, success, failed
        started_at -> Text,
        ended_at -> Nullable<Text>,
        duration -> Nullable<Double>,    // seconds
        stdout -> Nullable<Text>,
        stderr -> Nullable<Text>,
        return_value -> Nullable<Text>,
    }
}

diesel::table! {
    events (id) {
        id -> Integer,
        timestamp -> Text,
        project_id -> Integer,
        run_id -> Nullable<Integer>,
        event_type -> Text,              // info, warning, error, run, metric
        message -> Nullable<Text>,
        metadata_json -> Nullable<Text>, // opaque, stored verbatim
    }
}
