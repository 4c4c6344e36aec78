use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(AssignmentId);
id_newtype!(SubmissionId);
id_newtype!(FileId);

/// Lifecycle of one file staged for a solution, keyed by file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Queued,
    Uploading,
    Uploaded,
    Failed,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    #[default]
    None,
    Creating,
    Sending,
    Processing,
    Finished,
    Failed,
}

/// Which kind of solution a submission evaluates. Ordinary assignment
/// submissions and reference-solution evaluations share the same pipeline
/// and differ only in the submit endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolutionKind {
    Assignment,
    Reference,
}
