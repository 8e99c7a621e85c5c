use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::Error,
    request::{Request, RequestKind},
    submission::{FileId, SubmissionId},
};

/// An aggregate snapshot of everything queued or being processed.
/// ---
/// `file_count` always equals the total size of all file sets.
/// A submission's entry is only dropped once its STOP has been
/// observed and its file set is empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub file_count: usize,
    pub submissions: HashMap<SubmissionId, HashSet<FileId>>,
    #[serde(skip)]
    stopped: HashSet<SubmissionId>,
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.file_count == 0
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.len()
    }

    /// Folds one change event into this status.
    pub fn apply(&mut self, request: &Request) -> Result<(), Error> {
        let sid = request.submission_id;

        match request.kind {
            RequestKind::SubmissionStart => {
                self.submissions.entry(sid).or_default();
                self.stopped.remove(&sid);
            }
            RequestKind::SrcAdd | RequestKind::ArchiveAdd | RequestKind::TestAdd => {
                let fid = request.required_file_id()?;
                if self.submissions.entry(sid).or_default().insert(fid) {
                    self.file_count += 1;
                }
            }
            RequestKind::FileRemove => {
                let fid = request.required_file_id()?;
                let removed = self
                    .submissions
                    .get_mut(&sid)
                    .map(|files| files.remove(&fid))
                    .unwrap_or(false);

                if removed {
                    self.file_count -= 1;
                } else {
                    warn!(
                        "Status: removal of unknown file {} from submission {} ignored.",
                        fid, sid
                    );
                }
                self.drop_if_finished(sid);
            }
            RequestKind::SubmissionStop => {
                self.stopped.insert(sid);
                self.drop_if_finished(sid);
            }
        }

        Ok(())
    }

    fn drop_if_finished(&mut self, sid: SubmissionId) {
        if !self.stopped.contains(&sid) {
            return;
        }

        let empty = self
            .submissions
            .get(&sid)
            .map(|files| files.is_empty())
            .unwrap_or(true);

        if empty {
            self.submissions.remove(&sid);
            self.stopped.remove(&sid);
        }
    }

    /// Checks `file_count` against the file sets.
    pub fn is_consistent(&self) -> bool {
        self.file_count == self.submissions.values().map(HashSet::len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(sid: SubmissionId, fid: FileId) -> Request {
        Request {
            submission_id: sid,
            file_id: Some(fid),
            kind: RequestKind::SrcAdd,
        }
    }

    #[test]
    fn test_add_and_remove_keep_count_consistent() {
        let mut status = Status::new();
        let sid = SubmissionId::new();
        let files: Vec<FileId> = (0..5).map(|_| FileId::new()).collect();

        status.apply(&Request::start_submission(sid)).unwrap();
        for fid in &files {
            status.apply(&add(sid, *fid)).unwrap();
            assert!(status.is_consistent());
        }
        assert_eq!(status.file_count, 5);

        // Duplicate adds do not double count.
        status.apply(&add(sid, files[0])).unwrap();
        assert_eq!(status.file_count, 5);

        for fid in &files {
            status.apply(&Request::remove_file(sid, *fid)).unwrap();
            assert!(status.is_consistent());
        }
        assert!(status.is_idle());
        // Not stopped yet, so the entry stays.
        assert_eq!(status.submission_count(), 1);

        status.apply(&Request::stop_submission(sid)).unwrap();
        assert_eq!(status.submission_count(), 0);
    }

    #[test]
    fn test_stop_defers_removal_until_empty() {
        let mut status = Status::new();
        let sid = SubmissionId::new();
        let fid = FileId::new();

        status.apply(&Request::start_submission(sid)).unwrap();
        status.apply(&add(sid, fid)).unwrap();
        status.apply(&Request::stop_submission(sid)).unwrap();
        assert_eq!(status.submission_count(), 1);

        status.apply(&Request::remove_file(sid, fid)).unwrap();
        assert_eq!(status.submission_count(), 0);
        assert!(status.is_consistent());
    }

    #[test]
    fn test_unknown_removal_is_ignored() {
        let mut status = Status::new();
        status
            .apply(&Request::remove_file(SubmissionId::new(), FileId::new()))
            .unwrap();
        assert_eq!(status.file_count, 0);
        assert!(status.is_consistent());
    }

    #[test]
    fn test_file_request_without_file_id_is_rejected() {
        let mut status = Status::new();
        let req = Request {
            submission_id: SubmissionId::new(),
            file_id: None,
            kind: RequestKind::TestAdd,
        };
        assert!(status.apply(&req).is_err());
    }

    #[test]
    fn test_snapshot_serializes_public_fields() {
        let mut status = Status::new();
        let sid = SubmissionId::new();
        status.apply(&add(sid, FileId::new())).unwrap();

        let bytes = serde_json::to_vec(&status).unwrap();
        let decoded: Status = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.file_count, 1);
        assert_eq!(decoded.submissions[&sid].len(), 1);
    }
}
