//
// render_workflows.rs
// Dicom-Frames-rs
//
// End-to-end tests: ingest synthetic multi-frame objects, then render, bound-check, and share decodes.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::{EXPLICIT_VR_BIG_ENDIAN, EXPLICIT_VR_LITTLE_ENDIAN};
use dicom_frames::config::ServiceConfig;
use dicom_frames::models::{OutputFormat, PixelEncoding};
use dicom_frames::registry::{ConflictPolicy, RegistrationOutcome};
use dicom_frames::render::SizeHint;
use dicom_frames::window::{Preset, WindowingMode};
use dicom_frames::{RenderError, RenderService};
use tempfile::{tempdir, TempDir};

fn put(obj: &mut InMemDicomObject, group: u16, element: u16, vr: VR, value: PrimitiveValue) {
    obj.put(DataElement::new(Tag(group, element), vr, value));
}

fn image_header(obj: &mut InMemDicomObject, frames: u32, rows: u16, cols: u16) {
    put(obj, 0x0008, 0x0016, VR::UI, PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.7"));
    put(obj, 0x0008, 0x0018, VR::UI, PrimitiveValue::from("1.2.826.0.1.3680043.2.1125.7"));
    put(obj, 0x0008, 0x0060, VR::CS, PrimitiveValue::from("CT"));
    put(obj, 0x0010, 0x0020, VR::LO, PrimitiveValue::from("PAT001"));
    put(obj, 0x0028, 0x0008, VR::IS, PrimitiveValue::from(frames.to_string()));
    put(obj, 0x0028, 0x0010, VR::US, PrimitiveValue::from(rows));
    put(obj, 0x0028, 0x0011, VR::US, PrimitiveValue::from(cols));
}

/// 12-in-16-bit MONOCHROME2 object whose samples come from `sample(frame, row, col)`.
fn multiframe_object<F>(frames: u32, rows: u16, cols: u16, sample: F, big_endian: bool) -> InMemDicomObject
where
    F: Fn(u32, usize, usize) -> u16,
{
    let mut obj = InMemDicomObject::new_empty_with_dict(StandardDataDictionary);
    image_header(&mut obj, frames, rows, cols);
    put(&mut obj, 0x0028, 0x0002, VR::US, PrimitiveValue::from(1_u16));
    put(&mut obj, 0x0028, 0x0004, VR::CS, PrimitiveValue::from("MONOCHROME2"));
    put(&mut obj, 0x0028, 0x0100, VR::US, PrimitiveValue::from(16_u16));
    put(&mut obj, 0x0028, 0x0101, VR::US, PrimitiveValue::from(12_u16));
    put(&mut obj, 0x0028, 0x0102, VR::US, PrimitiveValue::from(11_u16));
    put(&mut obj, 0x0028, 0x0103, VR::US, PrimitiveValue::from(0_u16));

    let (rows, cols) = (rows as usize, cols as usize);
    let mut words = Vec::with_capacity(frames as usize * rows * cols);
    for f in 0..frames {
        for r in 0..rows {
            for c in 0..cols {
                words.push(sample(f, r, c));
            }
        }
    }
    let value = if big_endian {
        // Typed words are written in the file's byte order.
        PrimitiveValue::U16(words.into_iter().collect())
    } else {
        PrimitiveValue::from(words.iter().flat_map(|w| w.to_le_bytes()).collect::<Vec<u8>>())
    };
    put(&mut obj, 0x7fe0, 0x0010, VR::OW, value);
    obj
}

fn write_object(dir: &Path, name: &str, transfer_syntax: &str, obj: InMemDicomObject) -> PathBuf {
    let path = dir.join(name);
    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(transfer_syntax)
        .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
        .media_storage_sop_instance_uid("1.2.826.0.1.3680043.2.1125.7")
        .build()
        .expect("meta");
    let mut file_obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for elem in obj {
        file_obj.put(elem);
    }
    file_obj.write_to_file(&path).expect("write test dicom");
    path
}

fn write_multiframe<F>(dir: &Path, name: &str, frames: u32, rows: u16, cols: u16, sample: F) -> PathBuf
where
    F: Fn(u32, usize, usize) -> u16,
{
    let obj = multiframe_object(frames, rows, cols, sample, false);
    write_object(dir, name, EXPLICIT_VR_LITTLE_ENDIAN.uid(), obj)
}

fn service(dir: &TempDir) -> RenderService {
    RenderService::new(ServiceConfig::with_root(dir.path().join("store"))).expect("service")
}

fn gray_levels(png: &[u8]) -> HashSet<u8> {
    image::load_from_memory(png)
        .expect("decode png")
        .to_luma8()
        .pixels()
        .map(|p| p.0[0])
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn renders_middle_frame_of_a_96_frame_series() {
    let dir = tempdir().expect("tempdir");
    let path = write_multiframe(dir.path(), "series.dcm", 96, 512, 512, |f, r, c| {
        ((r * 3 + c * 5 + f as usize * 11) % 4096) as u16
    });
    let service = service(&dir);
    let ingested = service
        .ingest_path(&path, "PAT001", ConflictPolicy::Reject)
        .await
        .expect("ingest");

    let viewer = service
        .render_for_viewer(
            "PAT001",
            "series.dcm",
            50,
            WindowingMode::Auto,
            OutputFormat::Png,
            SizeHint::default(),
        )
        .await
        .expect("render frame 50");

    assert_eq!(viewer.asset_id, ingested.asset_id);
    assert_eq!(viewer.metadata.rows, 512);
    assert_eq!(viewer.metadata.columns, 512);
    assert_eq!(viewer.metadata.bits_allocated, 16);
    assert_eq!(viewer.metadata.frame_count, 96);
    assert_eq!(viewer.metadata.extracted_frame, 50);

    let decoded = image::load_from_memory(&viewer.image_bytes).expect("png");
    assert_eq!((decoded.width(), decoded.height()), (512, 512));
    assert!(gray_levels(&viewer.image_bytes).len() >= 2);
}

#[tokio::test]
async fn frame_index_equal_to_count_is_out_of_bounds_without_decoding() {
    let dir = tempdir().expect("tempdir");
    let path = write_multiframe(dir.path(), "small.dcm", 96, 8, 8, |f, r, c| (f as usize + r + c) as u16);
    let service = service(&dir);
    let id = service
        .ingest_path(&path, "PAT001", ConflictPolicy::Reject)
        .await
        .expect("ingest")
        .asset_id;

    let err = service
        .render(&id, 96, WindowingMode::Auto, OutputFormat::Png, SizeHint::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RenderError::FrameIndexOutOfBounds {
            requested: 96,
            available: 96
        }
    ));
    assert_eq!(service.cache().stats().decodes, 0);
}

#[tokio::test]
async fn single_frame_asset_serves_only_frame_zero() {
    let dir = tempdir().expect("tempdir");
    let path = write_multiframe(dir.path(), "single.dcm", 1, 16, 16, |_, r, c| (r * 16 + c) as u16);
    let service = service(&dir);
    let id = service
        .ingest_path(&path, "PAT001", ConflictPolicy::Reject)
        .await
        .expect("ingest")
        .asset_id;

    let frame = service
        .render(&id, 0, WindowingMode::Auto, OutputFormat::Png, SizeHint::default())
        .await
        .expect("frame 0");
    assert_eq!((frame.width, frame.height), (16, 16));

    let err = service
        .render(&id, 1, WindowingMode::Auto, OutputFormat::Png, SizeHint::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RenderError::FrameIndexOutOfBounds {
            requested: 1,
            available: 1
        }
    ));
}

#[tokio::test]
async fn distinct_frames_render_distinct_images() {
    let dir = tempdir().expect("tempdir");
    let path = write_multiframe(dir.path(), "stack.dcm", 3, 16, 16, |f, r, c| {
        (f as usize * 200 + (r * 16 + c) % 50) as u16
    });
    let service = service(&dir);
    let id = service
        .ingest_path(&path, "PAT001", ConflictPolicy::Reject)
        .await
        .expect("ingest")
        .asset_id;

    let mut outputs = Vec::new();
    for frame in 0..3 {
        let rendered = service
            .render(
                &id,
                frame,
                WindowingMode::Preset(Preset::Wide),
                OutputFormat::Png,
                SizeHint::default(),
            )
            .await
            .expect("render");
        assert_eq!(rendered.frame_index, frame);
        outputs.push(rendered.bytes);
    }
    assert_ne!(outputs[0], outputs[1]);
    assert_ne!(outputs[1], outputs[2]);
    assert_ne!(outputs[0], outputs[2]);
    assert_eq!(service.cache().stats().decodes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_frame_requests_share_a_single_decode() {
    let dir = tempdir().expect("tempdir");
    let path = write_multiframe(dir.path(), "burst.dcm", 32, 128, 128, |f, r, c| {
        ((r + c) * 8 + f as usize * 17) as u16 % 4096
    });
    let service = Arc::new(service(&dir));
    let id = service
        .ingest_path(&path, "PAT001", ConflictPolicy::Reject)
        .await
        .expect("ingest")
        .asset_id;

    let mut handles = Vec::new();
    for frame in 0..20u32 {
        let service = Arc::clone(&service);
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            service
                .render(&id, frame, WindowingMode::Auto, OutputFormat::Png, SizeHint::default())
                .await
        }));
    }
    for (frame, handle) in handles.into_iter().enumerate() {
        let rendered = handle.await.expect("join").expect("render");
        assert_eq!(rendered.frame_index, frame as u32);
    }

    let stats = service.cache().stats();
    assert_eq!(stats.decodes, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn thumbnail_fits_the_bounding_box() {
    let dir = tempdir().expect("tempdir");
    let path = write_multiframe(dir.path(), "wide.dcm", 2, 64, 256, |_, r, c| (r * 4 + c) as u16);
    let service = service(&dir);
    let id = service
        .ingest_path(&path, "PAT001", ConflictPolicy::Reject)
        .await
        .expect("ingest")
        .asset_id;

    let thumb = service.thumbnail(&id).await.expect("thumbnail");
    assert_eq!((thumb.width, thumb.height), (128, 32));
    assert_eq!(thumb.frame_index, 0);

    let sized = service
        .render(
            &id,
            1,
            WindowingMode::Auto,
            OutputFormat::Jpeg,
            SizeHint {
                width: Some(512),
                height: None,
            },
        )
        .await
        .expect("resized");
    assert_eq!((sized.width, sized.height), (512, 128));
    assert!(sized.bytes.starts_with(&[0xFF, 0xD8]));
}

#[tokio::test]
async fn ingesting_the_same_bytes_twice_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let path = write_multiframe(dir.path(), "repeat.dcm", 2, 8, 8, |f, r, c| (f as usize + r * c) as u16);
    let bytes = std::fs::read(&path).expect("read fixture");
    let service = service(&dir);

    let first = service
        .ingest(bytes.clone(), "PAT009", "repeat.dcm", ConflictPolicy::Reject)
        .await
        .expect("first ingest");
    let second = service
        .ingest(bytes, "PAT009", "repeat.dcm", ConflictPolicy::Reject)
        .await
        .expect("second ingest");

    assert_eq!(first.asset_id, second.asset_id);
    assert_eq!(first.outcome, RegistrationOutcome::Created);
    assert_eq!(second.outcome, RegistrationOutcome::Existing);

    let listed = service.list_for_patient("PAT009").await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].frame_count, 2);
    assert_eq!(listed[0].origin_filename, "repeat.dcm");

    let other = write_multiframe(dir.path(), "other.dcm", 2, 8, 8, |_, _, _| 7);
    let err = service
        .ingest(
            std::fs::read(&other).expect("read other"),
            "PAT009",
            "repeat.dcm",
            ConflictPolicy::Reject,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RenderError::RegistryConflict { .. }));
}

#[tokio::test]
async fn compressed_assets_are_rejected_before_decoding() {
    let dir = tempdir().expect("tempdir");
    let path = write_multiframe(dir.path(), "jpeg.dcm", 4, 8, 8, |_, r, c| (r + c) as u16);
    let service = service(&dir);

    let mut extracted = dicom_frames::metadata::read_asset(&path).expect("header");
    extracted.asset.transfer_syntax = "1.2.840.10008.1.2.4.50".into();
    extracted.asset.encoding = PixelEncoding::Compressed;
    let id = service
        .registry()
        .register(&extracted.asset, "PAT001", "jpeg.dcm")
        .await
        .expect("register");

    let err = service
        .render(&id, 0, WindowingMode::Auto, OutputFormat::Png, SizeHint::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RenderError::UnsupportedEncoding { .. }));
    assert_eq!(service.cache().stats().decodes, 0);
}

#[tokio::test]
async fn header_read_reports_dimensions_without_pixels() {
    let dir = tempdir().expect("tempdir");
    let path = write_multiframe(dir.path(), "header.dcm", 5, 10, 12, |_, _, _| 0);
    let extracted = dicom_frames::metadata::read_asset(&path).expect("header");
    let asset = extracted.asset;

    assert_eq!((asset.rows, asset.columns, asset.frame_count), (10, 12, 5));
    assert_eq!(asset.bits_stored, 12);
    assert_eq!(asset.encoding, PixelEncoding::Native);
    assert_eq!(asset.modality.as_deref(), Some("CT"));
    assert!(extracted
        .warnings
        .iter()
        .any(|w| w.field == "WindowCenter/WindowWidth"));
}

#[tokio::test]
async fn directory_ingest_registers_every_file() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("input");
    std::fs::create_dir_all(input.join("nested")).expect("mkdir");
    write_multiframe(&input, "a.dcm", 2, 8, 8, |f, r, c| (f as usize + r + c) as u16);
    write_multiframe(&input.join("nested"), "b.dcm", 3, 8, 8, |f, r, c| (f as usize * r + c) as u16);
    std::fs::write(input.join("broken.dcm"), b"not dicom").expect("write broken");
    std::fs::write(input.join("notes.txt"), b"ignored").expect("write txt");

    let service = service(&dir);
    let report = dicom_frames::batch::ingest_directory(&service, &input, "PAT777", ConflictPolicy::Reject)
        .await
        .expect("batch");

    let names: Vec<_> = report.ingested.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["a.dcm", "nested/b.dcm"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "broken.dcm");

    let listed = service.list_for_patient("PAT777").await.expect("list");
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn leftover_temp_records_do_not_affect_lookups() {
    let dir = tempdir().expect("tempdir");
    let path = write_multiframe(dir.path(), "crash.dcm", 2, 8, 8, |f, r, c| (f as usize + r + c) as u16);
    let service = service(&dir);
    let id = service
        .ingest_path(&path, "PAT001", ConflictPolicy::Reject)
        .await
        .expect("ingest")
        .asset_id;

    // A write interrupted before its rename leaves a partial temp file beside the record.
    let records = dir.path().join("store").join("records");
    std::fs::write(records.join(format!("{}.json.tmp", id)), b"{\"asset_id\": \"trunc").expect("tmp");
    std::fs::write(records.join("0123456789abcdef0123456789abcdef.json.tmp"), b"").expect("tmp");

    let record = service.lookup(&id).await.expect("lookup");
    assert_eq!(record.metadata.frame_count, 2);
    let listed = service.list_for_patient("PAT001").await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].asset_id, id);

    // Reopening over the same root sees the same single record.
    let reopened = RenderService::new(ServiceConfig::with_root(dir.path().join("store"))).expect("reopen");
    assert_eq!(reopened.list_for_patient("PAT001").await.expect("list").len(), 1);
}

#[tokio::test]
async fn planar_rgb_frames_render_in_color() {
    let dir = tempdir().expect("tempdir");
    let (rows, cols) = (4_u16, 6_u16);
    let plane = rows as usize * cols as usize;
    let mut obj = InMemDicomObject::new_empty_with_dict(StandardDataDictionary);
    image_header(&mut obj, 2, rows, cols);
    put(&mut obj, 0x0028, 0x0002, VR::US, PrimitiveValue::from(3_u16));
    put(&mut obj, 0x0028, 0x0004, VR::CS, PrimitiveValue::from("RGB"));
    put(&mut obj, 0x0028, 0x0006, VR::US, PrimitiveValue::from(1_u16));
    put(&mut obj, 0x0028, 0x0100, VR::US, PrimitiveValue::from(8_u16));
    put(&mut obj, 0x0028, 0x0101, VR::US, PrimitiveValue::from(8_u16));
    put(&mut obj, 0x0028, 0x0102, VR::US, PrimitiveValue::from(7_u16));
    put(&mut obj, 0x0028, 0x0103, VR::US, PrimitiveValue::from(0_u16));
    // Frame 0 is pure red, frame 1 pure blue; each frame holds three planes.
    let mut bytes = Vec::new();
    for color in [[255_u8, 0, 0], [0, 0, 255]] {
        for channel in color {
            bytes.extend(std::iter::repeat(channel).take(plane));
        }
    }
    put(&mut obj, 0x7fe0, 0x0010, VR::OB, PrimitiveValue::from(bytes));
    let path = write_object(dir.path(), "rgb.dcm", EXPLICIT_VR_LITTLE_ENDIAN.uid(), obj);

    let service = service(&dir);
    let id = service
        .ingest_path(&path, "PAT001", ConflictPolicy::Reject)
        .await
        .expect("ingest")
        .asset_id;

    for (frame, expected) in [(0_u32, [255_u8, 0, 0]), (1, [0, 0, 255])] {
        let rendered = service
            .render(&id, frame, WindowingMode::Auto, OutputFormat::Png, SizeHint::default())
            .await
            .expect("render");
        let image = image::load_from_memory(&rendered.bytes).expect("png").to_rgb8();
        assert_eq!((image.width(), image.height()), (cols as u32, rows as u32));
        assert!(image.pixels().all(|p| p.0 == expected), "frame {}", frame);
    }
    assert_eq!(service.cache().stats().decodes, 1);
}

#[tokio::test]
async fn big_endian_files_render_like_little_endian_ones() {
    let dir = tempdir().expect("tempdir");
    let sample = |f: u32, r: usize, c: usize| ((r * 97 + c * 13 + f as usize * 500) % 4096) as u16;
    let little = write_multiframe(dir.path(), "little.dcm", 3, 16, 16, sample);
    let big = write_object(
        dir.path(),
        "big.dcm",
        EXPLICIT_VR_BIG_ENDIAN.uid(),
        multiframe_object(3, 16, 16, sample, true),
    );

    let service = service(&dir);
    let big_header = dicom_frames::metadata::read_asset(&big).expect("header").asset;
    assert_eq!(big_header.encoding, PixelEncoding::Native);
    assert_eq!(big_header.pixel_data.expect("span").length, 3 * 16 * 16 * 2);

    let mut rendered = Vec::new();
    for path in [&little, &big] {
        let id = service
            .ingest_path(path, "PAT001", ConflictPolicy::Reject)
            .await
            .expect("ingest")
            .asset_id;
        let frame = service
            .render(&id, 2, WindowingMode::Auto, OutputFormat::Png, SizeHint::default())
            .await
            .expect("render");
        rendered.push(frame.bytes);
    }
    assert_eq!(rendered[0], rendered[1]);
    assert!(gray_levels(&rendered[1]).len() > 16);
}

#[tokio::test]
async fn objects_without_pixel_data_are_refused_at_ingest() {
    let dir = tempdir().expect("tempdir");
    let mut obj = multiframe_object(2, 8, 8, |_, _, _| 0, false);
    obj.remove_element(Tag(0x7fe0, 0x0010));
    let path = write_object(dir.path(), "empty.dcm", EXPLICIT_VR_LITTLE_ENDIAN.uid(), obj);

    let err = dicom_frames::metadata::read_asset(&path).unwrap_err();
    assert!(matches!(err, RenderError::UnreadableAsset(_)));

    let service = service(&dir);
    let err = service
        .ingest_path(&path, "PAT001", ConflictPolicy::Reject)
        .await
        .unwrap_err();
    assert!(matches!(err, RenderError::UnreadableAsset(_)));
    assert!(service.list_for_patient("PAT001").await.expect("list").is_empty());
}
