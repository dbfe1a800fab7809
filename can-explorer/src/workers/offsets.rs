//! Offset resolver
//!
//! Finds the first part of a route that carries CAN frames and the time of
//! its first frame. Every later relative time is measured from that frame.

use crate::formats::SegmentParser;
use crate::source::PartSource;
use crate::types::{ExplorerError, Offsets, Result};

/// Offset worker input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRequest {
    pub part_count: u32,
    pub base: String,
}

/// Scan parts in order until one yields a CAN frame
pub fn resolve_offsets(source: &dyn PartSource, request: &OffsetRequest) -> Result<Offsets> {
    log::info!("Resolving CAN offsets over {} parts of {}", request.part_count, request.base);

    for part in 0..request.part_count {
        let bytes = source
            .fetch(&request.base, part)
            .map_err(|e| ExplorerError::OffsetResolution(e.to_string()))?;

        let first = SegmentParser::parse(part, &bytes).find_map(|frame| frame.ok());
        if let Some(frame) = first {
            let offsets = Offsets { frame_offset: part, first_frame_time: frame.time() };
            log::info!(
                "CAN frames begin in part {} at {:.3}s",
                offsets.frame_offset,
                offsets.first_frame_time
            );
            return Ok(offsets);
        }
        log::debug!("Part {} has no CAN frames", part);
    }

    Err(ExplorerError::OffsetResolution(format!(
        "no CAN frames in any of {} parts of {}",
        request.part_count, request.base
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::SegmentWriter;
    use crate::source::MemoryPartSource;

    fn request(part_count: u32) -> OffsetRequest {
        OffsetRequest { part_count, base: "mem".to_string() }
    }

    #[test]
    fn test_first_part_with_frames_wins() {
        let source = MemoryPartSource::new()
            .with_part(0, SegmentWriter::new().other(2, 100, b"boot").finish())
            .with_part(1, SegmentWriter::new().frame(2_500_000_000, 0, 0x10, &[0]).finish())
            .with_part(2, SegmentWriter::new().frame(9_000_000_000, 0, 0x10, &[0]).finish());

        let offsets = resolve_offsets(&source, &request(3)).unwrap();
        assert_eq!(offsets.frame_offset, 1);
        assert_eq!(offsets.first_frame_time, 2.5);
        assert_eq!(source.fetch_count(2), 0);
    }

    #[test]
    fn test_no_frames_is_a_resolution_failure() {
        let source = MemoryPartSource::new().with_part(0, Vec::new());
        let err = resolve_offsets(&source, &request(1)).unwrap_err();
        assert!(matches!(err, ExplorerError::OffsetResolution(_)));
    }

    #[test]
    fn test_fetch_error_is_a_resolution_failure() {
        let source = MemoryPartSource::new();
        assert!(matches!(
            resolve_offsets(&source, &request(2)),
            Err(ExplorerError::OffsetResolution(_))
        ));
    }
}
