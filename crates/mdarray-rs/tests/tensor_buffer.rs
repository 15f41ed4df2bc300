mod support;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mdarray_rs::engine::MemoryDesc;
use mdarray_rs::tensor::alloc::is_aligned;
use mdarray_rs::tensor::AlignedBuffer;
use mdarray_rs::{
    DType, EngineFormat, ExportFlags, ExportedView, ExternalView, MdarrayError, MemoryLayout,
    TensorBuffer,
};
use support::{rejecting, HostEngine};

/// Builds an external float view `offset` bytes past a 64-byte boundary.
fn view_at_offset(
    values: &[f32],
    shape: &[usize],
    offset: usize,
) -> (ExternalView, *mut u8, Arc<AtomicUsize>) {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    let mut block = AlignedBuffer::allocate(bytes.len() + offset).unwrap();
    block.as_bytes_mut()[offset..].copy_from_slice(&bytes);
    let ptr = unsafe { block.as_ptr().add(offset) };
    let released = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&released);
    let view = unsafe {
        ExternalView::from_raw_parts(
            NonNull::new(ptr).unwrap(),
            bytes.len(),
            4,
            "f",
            shape,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(block);
            },
        )
    };
    (view, ptr, released)
}

fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|idx| idx as f32 * 0.5).collect()
}

#[test]
fn nchw_float_buffer_reports_size_rank_and_strides() {
    let engine = HostEngine::default();
    let buffer = TensorBuffer::new(&engine, &[2, 3, 4, 4], DType::F32, EngineFormat::NCHW)
        .unwrap_or_else(|err| panic!("allocation failed: {err}"));
    assert_eq!(buffer.size(), 96);
    assert_eq!(buffer.ndim(), 4);
    assert!(!buffer.is_borrowed());
    assert!(is_aligned(buffer.data(), 64));

    let view = buffer.export(ExportFlags::RECORDS).unwrap();
    assert_eq!(view.itemsize(), 4);
    assert_eq!(view.len(), 384);
    assert_eq!(view.format(), Some("f"));
    assert_eq!(view.ndim(), 4);
    assert_eq!(view.shape(), Some(&[2usize, 3, 4, 4][..]));
    assert_eq!(view.strides(), Some(&[192usize, 64, 16, 4][..]));
    assert!(view.suboffsets().is_none());
    assert!(!view.readonly());
    assert_eq!(view.buf(), buffer.data());
}

#[test]
fn aligned_external_buffer_is_adopted_without_copy() {
    let engine = HostEngine::default();
    let values = ramp(24);
    let (view, ptr, released) = view_at_offset(&values, &[2, 3, 4], 0);
    let buffer = TensorBuffer::from_external(&engine, view, EngineFormat::Any).unwrap();

    assert!(buffer.is_borrowed());
    assert_eq!(buffer.data(), ptr);
    assert_eq!(buffer.size(), 24);
    assert_eq!(buffer.as_slice::<f32>().unwrap(), values.as_slice());
    assert_eq!(released.load(Ordering::SeqCst), 0);

    drop(buffer);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn misaligned_external_buffer_is_copied_and_released() {
    let engine = HostEngine::default();
    let values = ramp(12);
    let (view, ptr, released) = view_at_offset(&values, &[3, 4], 4);
    assert!(!is_aligned(ptr, 64));
    let buffer = TensorBuffer::from_external(&engine, view, EngineFormat::NC).unwrap();

    assert!(!buffer.is_borrowed());
    assert_ne!(buffer.data(), ptr);
    assert!(is_aligned(buffer.data(), 64));
    assert_eq!(buffer.as_slice::<f32>().unwrap(), values.as_slice());
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn vector_backed_view_keeps_contents_either_way() {
    let engine = HostEngine::default();
    let view = ExternalView::from_vec(vec![3i32, -1, 4, -1, 5, -9], &[2, 3]);
    let buffer = TensorBuffer::from_external(&engine, view, EngineFormat::NC).unwrap();
    assert_eq!(buffer.dtype(), DType::I32);
    assert_eq!(buffer.as_slice::<i32>().unwrap(), &[3, -1, 4, -1, 5, -9]);
}

#[test]
fn eight_byte_items_are_rejected() {
    let engine = HostEngine::default();
    let released = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&released);
    let mut backing = vec![0f64; 4];
    let ptr = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
    let view = unsafe {
        ExternalView::from_raw_parts(ptr, 32, 8, "d", &[4], move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    };
    let err = TensorBuffer::from_external(&engine, view, EngineFormat::X).unwrap_err();
    assert!(matches!(
        err,
        MdarrayError::UnsupportedDataType { itemsize: 8, .. }
    ));
    assert_eq!(released.load(Ordering::SeqCst), 1);
    drop(backing);
}

#[test]
fn unknown_format_code_is_rejected() {
    let engine = HostEngine::default();
    let block = AlignedBuffer::allocate(16).unwrap();
    let view = ExternalView::from_aligned(block, 4, "I", &[4]);
    let err = TensorBuffer::from_external(&engine, view, EngineFormat::X).unwrap_err();
    assert!(matches!(err, MdarrayError::UnsupportedDataType { .. }));
}

#[test]
fn inconsistent_lengths_are_rejected() {
    let engine = HostEngine::default();
    let block = AlignedBuffer::allocate(10).unwrap();
    let view = ExternalView::from_aligned(block, 4, "f", &[2]);
    assert!(matches!(
        TensorBuffer::from_external(&engine, view, EngineFormat::X),
        Err(MdarrayError::LengthMismatch {
            len: 10,
            itemsize: 4
        })
    ));

    let block = AlignedBuffer::allocate(16).unwrap();
    let view = ExternalView::from_aligned(block, 4, "f", &[3]);
    assert!(matches!(
        TensorBuffer::from_external(&engine, view, EngineFormat::X),
        Err(MdarrayError::LengthMismatch { .. })
    ));
}

#[test]
fn export_round_trips_to_construction_layout() {
    let engine = HostEngine::default();
    for shape in [vec![7usize], vec![2, 5], vec![2, 3, 4, 4], vec![1, 2, 1, 3, 2, 1]] {
        let buffer = TensorBuffer::new(&engine, &shape, DType::I32, EngineFormat::Any).unwrap();
        let view = buffer.export(ExportFlags::RECORDS).unwrap();
        let expected = MemoryLayout::from_shape(&shape, DType::I32).unwrap();
        assert_eq!(view.to_layout().unwrap(), expected);
        assert_eq!(buffer.layout().unwrap(), &expected);
    }
}

#[test]
fn repeated_exports_are_identical() {
    let engine = HostEngine::default();
    let buffer = TensorBuffer::new(&engine, &[3, 5], DType::F32, EngineFormat::NC).unwrap();
    let first = buffer.export(ExportFlags::RECORDS).unwrap();
    let second = buffer.export(ExportFlags::RECORDS).unwrap();
    assert_eq!(first.format(), second.format());
    assert_eq!(first.shape(), second.shape());
    assert_eq!(first.strides(), second.strides());
    assert_eq!(buffer.export_count(), 2);
    first.release();
    assert_eq!(buffer.export_count(), 1);
    drop(second);
    assert_eq!(buffer.export_count(), 0);
}

#[test]
fn layout_recompute_mode_exports_the_same_metadata() {
    let engine = HostEngine::default();
    let buffer = TensorBuffer::new(&engine, &[4, 4], DType::F32, EngineFormat::NC)
        .unwrap()
        .with_layout_recompute(true);
    let first = buffer.export(ExportFlags::RECORDS).unwrap();
    let second = buffer.export(ExportFlags::RECORDS).unwrap();
    assert_eq!(first.strides(), Some(&[16usize, 4][..]));
    assert_eq!(first.strides(), second.strides());
}

#[test]
fn flags_select_populated_fields() {
    let engine = HostEngine::default();
    let buffer = TensorBuffer::new(&engine, &[2, 2], DType::I32, EngineFormat::NC).unwrap();

    let simple = buffer.export(ExportFlags::SIMPLE).unwrap();
    assert_eq!(simple.format(), None);
    assert_eq!(simple.ndim(), 0);
    assert_eq!(simple.shape(), None);
    assert_eq!(simple.strides(), None);
    assert_eq!(simple.len(), 16);
    assert!(simple.to_layout().is_err());

    let nd = buffer.export(ExportFlags::ND | ExportFlags::FORMAT).unwrap();
    assert_eq!(nd.format(), Some("i"));
    assert_eq!(nd.shape(), Some(&[2usize, 2][..]));
    assert_eq!(nd.strides(), None);

    let strided = buffer.export(ExportFlags::STRIDES).unwrap();
    assert_eq!(strided.format(), None);
    assert_eq!(strided.strides(), Some(&[8usize, 4][..]));
}

#[test]
fn fortran_order_and_missing_slot_are_invalid_requests() {
    let engine = HostEngine::default();
    let buffer = TensorBuffer::new(&engine, &[2, 2], DType::F32, EngineFormat::NC).unwrap();

    let err = buffer.export(ExportFlags::F_CONTIGUOUS).unwrap_err();
    assert!(matches!(err, MdarrayError::InvalidViewRequest(_)));
    let err = buffer.export_into(None, ExportFlags::RECORDS).unwrap_err();
    assert!(matches!(err, MdarrayError::InvalidViewRequest(_)));
    assert_eq!(buffer.export_count(), 0);

    let mut slot: Option<ExportedView> = None;
    buffer
        .export_into(Some(&mut slot), ExportFlags::C_CONTIGUOUS)
        .unwrap();
    assert_eq!(slot.as_ref().map(ExportedView::ndim), Some(2));
    assert_eq!(buffer.export_count(), 1);
}

#[test]
fn outstanding_export_keeps_adopted_memory_alive() {
    let engine = HostEngine::default();
    let values = ramp(8);
    let (view, ptr, released) = view_at_offset(&values, &[8], 0);
    let buffer = TensorBuffer::from_external(&engine, view, EngineFormat::X).unwrap();
    let exported = buffer.export(ExportFlags::FULL).unwrap();
    assert_eq!(exported.owner_refcount(), 2);

    drop(buffer);
    assert_eq!(released.load(Ordering::SeqCst), 0);
    assert_eq!(exported.buf(), ptr);
    assert_eq!(exported.owner_refcount(), 1);
    let expected: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    assert_eq!(exported.as_bytes(), expected.as_slice());

    exported.release();
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn outstanding_export_keeps_owned_memory_alive() {
    let engine = HostEngine::default();
    let mut buffer = TensorBuffer::new(&engine, &[4], DType::F32, EngineFormat::X).unwrap();
    buffer
        .as_mut_slice::<f32>()
        .unwrap()
        .copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    let exported = buffer.export(ExportFlags::RECORDS).unwrap();
    drop(buffer);
    assert_eq!(&exported.as_bytes()[12..], &4.0f32.to_ne_bytes());
}

#[test]
fn descriptor_buffers_are_zeroed_destinations() {
    let engine = HostEngine::default();
    let desc = MemoryDesc::new(&[4, 5], DType::I32, EngineFormat::NC);
    let buffer = TensorBuffer::from_descriptor(&engine, &desc).unwrap();
    assert_eq!(buffer.size(), 20);
    assert_eq!(buffer.ndim(), 2);
    assert_eq!(buffer.desc(), &desc);
    assert!(buffer.as_slice::<i32>().unwrap().iter().all(|v| *v == 0));
}

#[test]
fn typed_access_checks_dtype() {
    let engine = HostEngine::default();
    let buffer = TensorBuffer::new(&engine, &[3], DType::F32, EngineFormat::X).unwrap();
    assert!(matches!(
        buffer.as_slice::<i32>(),
        Err(MdarrayError::DTypeMismatch {
            expected: DType::F32,
            actual: DType::I32
        })
    ));
}

#[test]
fn rejected_engine_memory_releases_adopted_view() {
    let engine = rejecting();
    let (view, _ptr, released) = view_at_offset(&ramp(4), &[4], 0);
    let err = TensorBuffer::from_external(&engine, view, EngineFormat::X).unwrap_err();
    assert!(matches!(err, MdarrayError::Engine(_)));
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn rank_above_cap_is_rejected_before_allocation() {
    let engine = HostEngine::default();
    let dims = [1usize; 13];
    let err = TensorBuffer::new(&engine, &dims, DType::F32, EngineFormat::Any).unwrap_err();
    assert!(matches!(err, MdarrayError::TooManyDimensions { ndim: 13 }));
}

#[test]
fn mutable_access_is_refused_while_views_are_outstanding() {
    let engine = HostEngine::default();
    let mut buffer = TensorBuffer::new(&engine, &[4], DType::F32, EngineFormat::X).unwrap();
    let view = buffer.export(ExportFlags::RECORDS).unwrap();
    let frozen = view.as_bytes();

    assert!(matches!(
        buffer.as_mut_slice::<f32>(),
        Err(MdarrayError::ExportsOutstanding { views: 1 })
    ));
    assert_eq!(&frozen[..4], &[0u8; 4]);

    view.release();
    buffer.as_mut_slice::<f32>().unwrap()[0] = 1.5;
    assert_eq!(buffer.as_slice::<f32>().unwrap()[0], 1.5);
}
