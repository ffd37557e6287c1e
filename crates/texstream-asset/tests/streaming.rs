use std::io::Cursor;
use std::sync::{Arc, Mutex};

use texstream_asset::archive::{MemoryArchive, ResourceGroups};
use texstream_asset::error::StreamingError;
use texstream_asset::{
    GpuPageOutStrategy, GpuResidency, StreamingConfig, TextureCreateInfo, TextureEventReason, TextureGpuManager,
    TextureHandle, TextureListener, TransitionOptions,
};
use texstream_gfx::headless::HeadlessGpu;
use texstream_gfx::pixel_format::PixelFormat;
use texstream_gfx::texture_desc::TextureType;

const FACE_COLORS: [[u8; 4]; 6] = [
    [255, 0, 0, 255],
    [0, 255, 0, 255],
    [0, 0, 255, 255],
    [255, 255, 0, 255],
    [0, 255, 255, 255],
    [255, 0, 255, 255],
];
const FACE_NAMES: [&str; 6] = ["sky_rt.png", "sky_lf.png", "sky_up.png", "sky_dn.png", "sky_fr.png", "sky_bk.png"];

/// 记录所有收到的事件
#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<(TextureHandle, TextureEventReason)>>>);

impl TextureListener for EventLog {
    fn notify_texture_changed(&mut self, texture: TextureHandle, reason: TextureEventReason, _extra: Option<&StreamingError>) {
        self.0.lock().unwrap().push((texture, reason));
    }
}

impl EventLog {
    fn count(&self, texture: TextureHandle, reason: TextureEventReason) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, r)| *t == texture && *r == reason)
            .count()
    }

    fn reasons(&self, texture: TextureHandle) -> Vec<TextureEventReason> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == texture)
            .map(|(_, r)| *r)
            .collect()
    }
}

fn encode_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

fn sky_faces() -> Vec<(String, Vec<u8>)> {
    FACE_NAMES
        .iter()
        .zip(FACE_COLORS)
        .map(|(name, color)| (name.to_string(), encode_png(8, 8, color)))
        .collect()
}

fn groups_with(files: &[(String, Vec<u8>)]) -> Arc<ResourceGroups> {
    let archive = Arc::new(MemoryArchive::new("mem"));
    for (name, bytes) in files {
        archive.insert(name.clone(), bytes.clone());
    }
    let groups = Arc::new(ResourceGroups::new());
    groups.add_archive("General", archive);
    groups
}

fn config(on_main_thread: bool) -> StreamingConfig {
    StreamingConfig {
        budget: Vec::new(),
        staging_texture_max_budget_bytes: 4 * 1024 * 1024,
        streaming_on_main_thread: on_main_thread,
        ..Default::default()
    }
}

fn setup(files: &[(String, Vec<u8>)], config: StreamingConfig) -> (TextureGpuManager, Arc<HeadlessGpu>, EventLog) {
    texstream_crate_tools::init_log::init_test_log();

    let gpu = Arc::new(HeadlessGpu::default());
    let mut manager = TextureGpuManager::new(gpu.clone(), groups_with(files), config).unwrap();
    let log = EventLog::default();
    manager.add_listener(Box::new(log.clone()));
    (manager, gpu, log)
}

fn load(manager: &mut TextureGpuManager, handle: TextureHandle, target: GpuResidency) {
    manager.transition_to(handle, target, TransitionOptions::default()).unwrap();
}

#[test]
fn test_missing_resource_falls_back_to_placeholder() {
    let (mut manager, gpu, log) = setup(&[], config(false));
    assert!(manager.has_streaming_thread());

    let tex = manager.create_texture(TextureCreateInfo::new("missing.png")).unwrap();
    load(&mut manager, tex, GpuResidency::Resident);
    manager.wait_for(tex, false).unwrap();

    let texture = manager.texture(tex).unwrap();
    assert_eq!(texture.residency(), GpuResidency::Resident);
    assert!(texture.is_data_ready());
    assert_eq!((texture.width(), texture.height()), (2, 2));
    assert!(gpu.texture_data(texture.gpu_texture().unwrap()).is_some());

    assert_eq!(log.count(tex, TextureEventReason::ExceptionThrown), 1);
    assert_eq!(log.count(tex, TextureEventReason::ReadyForRendering), 1);
    // 占位图不应该写进 metadata cache
    assert!(manager.metadata_cache().get("missing.png").is_none());
}

#[test]
fn test_destroy_waits_for_in_flight_load() {
    let files = vec![("a.png".to_string(), encode_png(4, 4, [1, 2, 3, 4]))];
    let (mut manager, gpu, log) = setup(&files, config(false));

    let tex = manager.create_texture(TextureCreateInfo::new("a.png")).unwrap();
    load(&mut manager, tex, GpuResidency::Resident);
    manager.destroy_texture(tex).unwrap();

    // 加载结束之前纹理仍然存在，名字也仍然被占用
    assert!(manager.texture(tex).is_some());
    let err = manager.create_texture(TextureCreateInfo::new("a.png")).unwrap_err();
    assert!(matches!(err.downcast_ref::<StreamingError>(), Some(StreamingError::DuplicateAlias(_))));
    assert!(
        manager
            .transition_to(tex, GpuResidency::OnStorage, TransitionOptions::default())
            .is_err()
    );

    manager.wait_for_streaming_completion();

    assert!(manager.texture(tex).is_none());
    assert!(manager.find_texture("a.png").is_none());
    assert_eq!(gpu.live_texture_count(), 0);

    let reasons = log.reasons(tex);
    assert_eq!(log.count(tex, TextureEventReason::Deleted), 1);
    let ready = reasons.iter().position(|r| *r == TextureEventReason::ReadyForRendering).unwrap();
    let deleted = reasons.iter().position(|r| *r == TextureEventReason::Deleted).unwrap();
    assert!(ready < deleted);

    // 名字可以重新使用
    manager.create_texture(TextureCreateInfo::new("a.png")).unwrap();
}

#[test]
fn test_out_of_date_metadata_cache_reloads_cubemap() {
    let (mut manager, gpu, log) = setup(&sky_faces(), config(false));
    manager
        .import_metadata_cache(
            r#"{
                "cache": {
                    "sky.png": { "resolution": [4, 4, 6], "mipmaps": 1, "format": "PFG_RGBA8_UNORM", "texture_type": 5, "poolId": 0 }
                }
            }"#,
        )
        .unwrap();

    let mut info = TextureCreateInfo::new("sky.png");
    info.initial_type = TextureType::TypeCube;
    let tex = manager.create_texture(info).unwrap();

    load(&mut manager, tex, GpuResidency::Resident);
    // 预测的形状立即生效
    assert_eq!(manager.texture(tex).unwrap().residency(), GpuResidency::Resident);
    assert_eq!(manager.texture(tex).unwrap().width(), 4);

    manager.wait_for_streaming_completion();

    assert_eq!(log.count(tex, TextureEventReason::MetadataCacheOutOfDate), 1);
    assert_eq!(log.count(tex, TextureEventReason::ReadyForRendering), 1);

    let texture = manager.texture(tex).unwrap();
    assert_eq!(texture.residency(), GpuResidency::Resident);
    assert_eq!(texture.pending_residency_changes(), 0);
    assert_eq!(texture.texture_type(), TextureType::TypeCube);
    assert_eq!((texture.width(), texture.height(), texture.depth_or_slices()), (8, 8, 6));

    let entry = manager.metadata_cache().get("sky.png").unwrap();
    assert_eq!((entry.desc.width, entry.desc.height, entry.desc.depth_or_slices), (8, 8, 6));

    let data = gpu.texture_data(texture.gpu_texture().unwrap()).unwrap();
    let face_bytes = 8 * 8 * 4;
    assert_eq!(data.len(), face_bytes * 6);
    for (face, color) in FACE_COLORS.iter().enumerate() {
        let slice = &data[face * face_bytes..(face + 1) * face_bytes];
        assert!(slice.chunks(4).all(|px| px == color), "face {} has the wrong data", face);
    }
}

#[test]
fn test_metadata_cache_round_trip_between_managers() {
    let files = vec![("a.png".to_string(), encode_png(16, 8, [9, 9, 9, 255]))];
    let (mut first, _gpu, _log) = setup(&files, config(true));
    first.reserve_pool_id(7, 16, 16, 4, 1, PixelFormat::Rgba8Unorm).unwrap();

    let tex = first.create_texture(TextureCreateInfo::new("a.png")).unwrap();
    load(&mut first, tex, GpuResidency::Resident);
    first.wait_for_streaming_completion();
    let exported = first.export_metadata_cache().unwrap();

    let (mut second, _gpu, _log) = setup(&files, config(true));
    second.import_metadata_cache(&exported).unwrap();
    // 重复导入不会重复预留
    second.import_metadata_cache(&exported).unwrap();

    assert_eq!(second.texture_pools().reserved_pools().count(), 1);
    let entry = second.metadata_cache().get("a.png").unwrap();
    assert_eq!((entry.desc.width, entry.desc.height), (16, 8));
    assert_eq!(second.export_metadata_cache().unwrap(), exported);
}

#[test]
fn test_save_to_system_ram_round_trip() {
    let files = vec![("a.png".to_string(), encode_png(8, 4, [40, 50, 60, 255]))];
    let (mut manager, gpu, log) = setup(&files, config(true));
    let tex = manager.create_texture(TextureCreateInfo::new("a.png")).unwrap();

    load(&mut manager, tex, GpuResidency::Resident);
    manager.wait_for_streaming_completion();
    assert!(manager.texture(tex).unwrap().sysram_copy().is_none());

    // 换出是同步完成的
    load(&mut manager, tex, GpuResidency::OnSystemRam);
    {
        let texture = manager.texture(tex).unwrap();
        assert_eq!(texture.residency(), GpuResidency::OnSystemRam);
        assert!(texture.gpu_texture().is_none());
        let copy = texture.sysram_copy().unwrap();
        assert_eq!(copy.len(), 8 * 4 * 4);
        assert!(copy.chunks(4).all(|px| px == [40, 50, 60, 255]));
    }
    assert_eq!(gpu.live_texture_count(), 0);
    assert_eq!(log.count(tex, TextureEventReason::LostResidency), 1);

    load(&mut manager, tex, GpuResidency::Resident);
    manager.wait_for_streaming_completion();

    let texture = manager.texture(tex).unwrap();
    assert_eq!(texture.residency(), GpuResidency::Resident);
    assert!(texture.is_data_ready());
    // 副本被上传消耗掉了
    assert!(texture.sysram_copy().is_none());
    let data = gpu.texture_data(texture.gpu_texture().unwrap()).unwrap();
    assert!(data.chunks(4).all(|px| px == [40, 50, 60, 255]));
}

#[test]
fn test_always_keep_system_ram_copy() {
    let files = vec![("a.png".to_string(), encode_png(4, 4, [7, 8, 9, 255]))];
    let (mut manager, gpu, _log) = setup(&files, config(true));
    let mut info = TextureCreateInfo::new("a.png");
    info.page_out_strategy = GpuPageOutStrategy::AlwaysKeepSystemRamCopy;
    let tex = manager.create_texture(info).unwrap();

    load(&mut manager, tex, GpuResidency::Resident);
    manager.wait_for_streaming_completion();
    assert_eq!(manager.texture(tex).unwrap().sysram_copy().map(<[u8]>::len), Some(4 * 4 * 4));

    load(&mut manager, tex, GpuResidency::OnSystemRam);
    assert_eq!(manager.texture(tex).unwrap().residency(), GpuResidency::OnSystemRam);

    load(&mut manager, tex, GpuResidency::Resident);
    manager.wait_for_streaming_completion();

    let texture = manager.texture(tex).unwrap();
    assert_eq!(texture.residency(), GpuResidency::Resident);
    assert!(texture.sysram_copy().is_some());
    let data = gpu.texture_data(texture.gpu_texture().unwrap()).unwrap();
    assert!(data.chunks(4).all(|px| px == [7, 8, 9, 255]));

    let usage = manager.memory_usage();
    assert_eq!(usage.num_resident, 1);
    assert_eq!(usage.sysram_bytes, 4 * 4 * 4);
}

#[test]
fn test_storage_to_system_ram_without_gpu() {
    let files = vec![("a.png".to_string(), encode_png(4, 2, [1, 1, 1, 255]))];
    let (mut manager, gpu, log) = setup(&files, config(false));
    let tex = manager.create_texture(TextureCreateInfo::new("a.png")).unwrap();

    load(&mut manager, tex, GpuResidency::OnSystemRam);
    manager.wait_for_streaming_completion();

    let texture = manager.texture(tex).unwrap();
    assert_eq!(texture.residency(), GpuResidency::OnSystemRam);
    assert_eq!(texture.pending_residency_changes(), 0);
    assert!(texture.gpu_texture().is_none());
    assert_eq!(texture.sysram_copy().map(<[u8]>::len), Some(4 * 2 * 4));
    assert_eq!(gpu.live_texture_count(), 0);
    assert_eq!(log.count(tex, TextureEventReason::FromStorageToSysRam), 1);
    assert_eq!(log.count(tex, TextureEventReason::GainedResidency), 0);
}

#[test]
fn test_failed_cubemap_to_system_ram_is_not_cached() {
    let (mut manager, _gpu, log) = setup(&[], config(false));
    let mut info = TextureCreateInfo::new("sky.png");
    info.initial_type = TextureType::TypeCube;
    let tex = manager.create_texture(info).unwrap();

    load(&mut manager, tex, GpuResidency::OnSystemRam);
    manager.wait_for_streaming_completion();

    let texture = manager.texture(tex).unwrap();
    assert_eq!(texture.residency(), GpuResidency::OnSystemRam);
    assert_eq!(texture.pending_residency_changes(), 0);
    // 每个面都用 2x2 的占位图代替
    assert_eq!(texture.sysram_copy().map(<[u8]>::len), Some(2 * 2 * 4 * 6));
    assert_eq!(log.count(tex, TextureEventReason::ExceptionThrown), 6);
    assert_eq!(log.count(tex, TextureEventReason::FromStorageToSysRam), 1);
    assert!(manager.metadata_cache().get("sky.png").is_none());
}

#[test]
fn test_multiload_threads_decode_in_parallel() {
    let mut files = sky_faces();
    for (i, name) in ["a.png", "b.png", "c.png"].iter().enumerate() {
        files.push((name.to_string(), encode_png(4 << i, 4, [i as u8, 0, 0, 255])));
    }
    let config = StreamingConfig {
        multiload_threads: 2,
        ..config(false)
    };
    let (mut manager, gpu, log) = setup(&files, config);

    let mut handles = Vec::new();
    for name in ["a.png", "b.png", "c.png"] {
        let tex = manager.create_texture(TextureCreateInfo::new(name)).unwrap();
        load(&mut manager, tex, GpuResidency::Resident);
        handles.push(tex);
    }
    let mut info = TextureCreateInfo::new("sky.png");
    info.initial_type = TextureType::TypeCube;
    let sky = manager.create_texture(info).unwrap();
    load(&mut manager, sky, GpuResidency::Resident);

    manager.wait_for_streaming_completion();

    for (i, tex) in handles.iter().enumerate() {
        let texture = manager.texture(*tex).unwrap();
        assert!(texture.is_data_ready());
        assert_eq!(texture.width(), 4 << i);
        assert_eq!(log.count(*tex, TextureEventReason::ReadyForRendering), 1);
    }

    let sky_texture = manager.texture(sky).unwrap();
    assert!(sky_texture.is_data_ready());
    assert_eq!(sky_texture.depth_or_slices(), 6);
    let data = gpu.texture_data(sky_texture.gpu_texture().unwrap()).unwrap();
    let face_bytes = 8 * 8 * 4;
    for (face, color) in FACE_COLORS.iter().enumerate() {
        assert_eq!(&data[face * face_bytes..face * face_bytes + 4], color);
    }
}

#[test]
fn test_queued_transitions_run_in_order() {
    let files = vec![("a.png".to_string(), encode_png(4, 4, [5, 5, 5, 255]))];
    let (mut manager, _gpu, log) = setup(&files, config(true));
    let tex = manager.create_texture(TextureCreateInfo::new("a.png")).unwrap();

    load(&mut manager, tex, GpuResidency::Resident);
    load(&mut manager, tex, GpuResidency::OnStorage);
    load(&mut manager, tex, GpuResidency::Resident);
    assert_eq!(manager.texture(tex).unwrap().next_residency(), GpuResidency::Resident);
    assert!(manager.texture(tex).unwrap().pending_residency_changes() > 0);

    manager.wait_for_streaming_completion();

    let texture = manager.texture(tex).unwrap();
    assert_eq!(texture.residency(), GpuResidency::Resident);
    assert_eq!(texture.pending_residency_changes(), 0);
    assert!(texture.is_data_ready());
    assert_eq!(log.count(tex, TextureEventReason::ReadyForRendering), 2);
    assert_eq!(log.count(tex, TextureEventReason::LostResidency), 1);

    let usage = manager.memory_usage();
    assert_eq!(usage.num_resident, 1);
    assert_eq!(usage.texture_bytes, 4 * 4 * 4);
}
