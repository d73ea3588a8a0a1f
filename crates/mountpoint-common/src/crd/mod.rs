//! Custom Resource Definitions for the Mountpoint Pod attachment controller
//!
//! This module contains all CRD definitions owned by the controller.

mod pod_attachment;

pub use pod_attachment::{
    field, MountpointS3PodAttachment, MountpointS3PodAttachmentSpec, WorkloadAttachment,
    ATTACHMENT_GENERATE_NAME, CRD_NAME,
};
