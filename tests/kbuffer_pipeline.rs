use approx::assert_relative_eq;
use ::kbuffer::*;

const SIZE: u32 = 64;

fn camera() -> Camera {
    Camera::new()
        .orthographic(2.0)
        .clip(0.1, 10.0)
        .viewport(Viewport::full(SIZE, SIZE))
}

fn full_quad(material: StorePassMaterial, z: f32) -> MeshInstance {
    MeshInstance::new("quad", MeshData::quad(2.0, 2.0), material)
        .with_transform(Transform::from_position(Vec3::new(0.0, 0.0, z)))
}

fn render(kbuffer: &mut KBuffer, drawables: &[&MeshInstance], background: Color) -> ImageTarget {
    let cam = camera();
    let mut target = ImageTarget::new(SIZE, SIZE);
    kbuffer.clear_pass();
    for d in drawables {
        kbuffer.draw(*d, Some(&cam));
    }
    kbuffer.resolve(&mut target, true, background, Some(&cam));
    target
}

#[test]
fn translucent_quad_over_opaque_red() {
    let registry = MaterialRegistry::new();
    let red = full_quad(StorePassMaterial::new(&registry).base_color(Color::RED), -5.0);
    let glass = full_quad(
        StorePassMaterial::new(&registry).translucent(Color::BLUE.with_alpha(0.5), 1.0),
        -2.0,
    );

    let mut kbuffer = KBuffer::new(SIZE, SIZE, 4);
    kbuffer.set_store_pass_material_count(registry.count());
    let target = render(&mut kbuffer, &[&red, &glass], Color::WHITE);

    for (x, y) in [(0, 0), (32, 32), (63, 17), (5, 63)] {
        let c = target.pixel(x, y).unwrap();
        assert_relative_eq!(c.r, 0.5, epsilon = 1e-5);
        assert_relative_eq!(c.g, 0.0, epsilon = 1e-5);
        assert_relative_eq!(c.b, 0.5, epsilon = 1e-5);
        assert_relative_eq!(c.a, 1.0, epsilon = 1e-5);
    }
    assert_eq!(kbuffer.phase(), FramePhase::Resolved);
    assert_eq!(kbuffer.stats().fragments_stored, 2 * 64 * 64);
}

#[test]
fn empty_frame_is_the_background() {
    let mut kbuffer = KBuffer::new(SIZE, SIZE, 4);
    let target = render(&mut kbuffer, &[], Color::BLACK);
    assert!(target.pixels().iter().all(|&c| c == Color::BLACK));
}

#[test]
fn draw_order_does_not_change_the_image() {
    let registry = MaterialRegistry::new();
    let quads = [
        full_quad(
            StorePassMaterial::new(&registry).base_color(Color::RED.with_alpha(0.4)),
            -3.0,
        ),
        full_quad(
            StorePassMaterial::new(&registry).base_color(Color::GREEN.with_alpha(0.6)),
            -4.0,
        ),
        full_quad(
            StorePassMaterial::new(&registry).base_color(Color::BLUE.with_alpha(0.7)),
            -6.0,
        ),
    ];
    let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

    let mut kbuffer = KBuffer::new(SIZE, SIZE, 4);
    kbuffer.set_store_pass_material_count(registry.count());
    let reference = render(
        &mut kbuffer,
        &[&quads[0], &quads[1], &quads[2]],
        Color::WHITE,
    );
    for order in orders {
        let drawables: Vec<&MeshInstance> = order.iter().map(|&i| &quads[i]).collect();
        let image = render(&mut kbuffer, &drawables, Color::WHITE);
        assert_eq!(image.pixels(), reference.pixels(), "order {:?}", order);
    }
}

#[test]
fn overflow_keeps_k_fragments_and_counts_the_rest() {
    let registry = MaterialRegistry::new();
    let quads: Vec<MeshInstance> = (0..6)
        .map(|i| {
            full_quad(
                StorePassMaterial::new(&registry).base_color(Color::WHITE.with_alpha(0.1)),
                -1.0 - i as f32,
            )
        })
        .collect();
    let drawables: Vec<&MeshInstance> = quads.iter().collect();

    let mut kbuffer = KBuffer::new(SIZE, SIZE, 4);
    kbuffer.set_store_pass_material_count(registry.count());
    render(&mut kbuffer, &drawables, Color::BLACK);

    assert_eq!(kbuffer.occupancy(10, 20), Some(4));
    assert_eq!(kbuffer.stats().fragments_stored, 4 * 64 * 64);
    assert_eq!(kbuffer.stats().fragments_dropped, 2 * 64 * 64);
    assert_eq!(kbuffer.fragment_store().total_occupancy(), 4 * 64 * 64);
}

#[test]
fn keep_nearest_overflow_keeps_the_nearest_surfaces() {
    let registry = MaterialRegistry::new();
    // Index i sits at z = -1 - i; drawn far to near.
    let quads: Vec<MeshInstance> = (0..6)
        .map(|i| {
            full_quad(
                StorePassMaterial::new(&registry).base_color(Color::WHITE.with_alpha(0.1)),
                -1.0 - i as f32,
            )
        })
        .collect();
    let drawables: Vec<&MeshInstance> = quads.iter().rev().collect();

    let mut kbuffer = KBuffer::new(SIZE, SIZE, 4);
    kbuffer.set_store_pass_material_count(registry.count());
    kbuffer.set_overflow_policy(OverflowPolicy::KeepNearest);
    render(&mut kbuffer, &drawables, Color::BLACK);

    let mut materials: Vec<u32> = kbuffer.fragments(7, 7).iter().map(|f| f.material).collect();
    materials.sort_unstable();
    assert_eq!(materials, vec![0, 1, 2, 3]);

    kbuffer.set_overflow_policy(OverflowPolicy::DropNewest);
    render(&mut kbuffer, &drawables, Color::BLACK);
    let mut materials: Vec<u32> = kbuffer.fragments(7, 7).iter().map(|f| f.material).collect();
    materials.sort_unstable();
    assert_eq!(materials, vec![2, 3, 4, 5]);
}

#[test]
fn stored_fragments_resolve_in_depth_order() {
    let registry = MaterialRegistry::new();
    let near = full_quad(StorePassMaterial::new(&registry).base_color(Color::RED.with_alpha(0.5)), -2.0);
    let far = full_quad(StorePassMaterial::new(&registry).base_color(Color::BLUE.with_alpha(0.5)), -7.0);

    let mut kbuffer = KBuffer::new(SIZE, SIZE, 4);
    kbuffer.set_store_pass_material_count(registry.count());
    let target = render(&mut kbuffer, &[&far, &near], Color::BLACK);

    let mut fragments = kbuffer.fragments(3, 3);
    ::kbuffer::kbuffer::sort_fragments(&mut fragments);
    assert!(fragments.windows(2).all(|w| w[0].depth <= w[1].depth));
    assert_eq!(fragments[0].material, near.material.index());

    // Red in front: 0.5 red, then 0.25 blue behind it.
    let c = target.pixel(3, 3).unwrap();
    assert_relative_eq!(c.r, 0.5, epsilon = 1e-5);
    assert_relative_eq!(c.b, 0.25, epsilon = 1e-5);
}

#[test]
fn set_k_clamps_to_the_supported_range() {
    let mut kbuffer = KBuffer::new(8, 8, 4);
    kbuffer.set_k(0);
    assert_eq!(kbuffer.k(), 1);
    kbuffer.set_k(99);
    assert_eq!(kbuffer.k(), 16);
    assert_eq!(KBuffer::new(8, 8, 0).k(), 1);
}

#[test]
fn resize_to_the_same_size_keeps_the_frame() {
    let registry = MaterialRegistry::new();
    let glass = full_quad(
        StorePassMaterial::new(&registry).base_color(Color::GREEN.with_alpha(0.5)),
        -3.0,
    );
    let mut kbuffer = KBuffer::new(SIZE, SIZE, 4);
    let first = render(&mut kbuffer, &[&glass], Color::WHITE);

    kbuffer.resize(SIZE, SIZE);
    assert_eq!(kbuffer.phase(), FramePhase::Resolved);
    assert_eq!(kbuffer.occupancy(1, 1), Some(1));

    let cam = camera();
    let mut again = ImageTarget::new(SIZE, SIZE);
    kbuffer.resolve(&mut again, true, Color::WHITE, Some(&cam));
    assert_eq!(again.pixels(), first.pixels());
}

#[test]
fn resize_reallocates_and_discards() {
    let registry = MaterialRegistry::new();
    let glass = full_quad(StorePassMaterial::new(&registry), -3.0);
    let mut kbuffer = KBuffer::new(SIZE, SIZE, 4);
    render(&mut kbuffer, &[&glass], Color::WHITE);

    kbuffer.resize(32, 16);
    assert_eq!((kbuffer.width(), kbuffer.height()), (32, 16));
    assert_eq!(kbuffer.phase(), FramePhase::Idle);
    assert_eq!(kbuffer.occupancy(31, 15), Some(0));
    assert_eq!(kbuffer.occupancy(32, 0), None);
}

#[test]
fn more_materials_than_declared_do_not_crash() {
    let registry = MaterialRegistry::new();
    let mut kbuffer = KBuffer::new(SIZE, SIZE, 16);
    kbuffer.set_store_pass_material_count(5);

    let quads: Vec<MeshInstance> = (0..8)
        .map(|i| {
            full_quad(
                StorePassMaterial::new(&registry).base_color(Color::RED.with_alpha(0.1)),
                -1.0 - 0.5 * i as f32,
            )
        })
        .collect();
    let drawables: Vec<&MeshInstance> = quads.iter().collect();
    render(&mut kbuffer, &drawables, Color::WHITE);

    assert_eq!(registry.count(), 8);
    assert!(kbuffer.palette().capacity() >= 8);
    assert_eq!(kbuffer.occupancy(0, 0), Some(8));
}

#[test]
fn invalid_draws_are_skipped() {
    let registry = MaterialRegistry::new();
    let disabled = full_quad(StorePassMaterial::new(&registry), -2.0).enabled(false);
    let mut broken = full_quad(StorePassMaterial::new(&registry), -2.0);
    broken.data.indices.pop();
    let fine = full_quad(StorePassMaterial::new(&registry), -2.0);

    let mut kbuffer = KBuffer::new(SIZE, SIZE, 4);
    kbuffer.clear_pass();
    kbuffer.draw(&disabled, Some(&camera()));
    kbuffer.draw(&broken, Some(&camera()));
    kbuffer.draw(&fine, None);
    assert_eq!(kbuffer.occupancy(0, 0), Some(0));
    assert_eq!(kbuffer.stats().skipped_draws, 2);
    assert_eq!(kbuffer.phase(), FramePhase::Cleared);

    kbuffer.draw(&fine, Some(&camera()));
    assert_eq!(kbuffer.occupancy(0, 0), Some(1));
}

#[test]
fn wall_inside_a_translucent_volume_is_order_independent() {
    let registry = MaterialRegistry::new();
    let volume = StorePassMaterial::new(&registry)
        .base_color(Color::BLACK.with_alpha(0.5))
        .translucent(Color::GREEN.with_alpha(0.5), 4.0);
    let quads = [
        full_quad(StorePassMaterial::new(&registry).base_color(Color::RED), -3.0),
        full_quad(volume.clone(), -2.0),
        full_quad(volume, -4.0),
    ];
    let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

    let mut kbuffer = KBuffer::new(SIZE, SIZE, 4);
    kbuffer.set_store_pass_material_count(registry.count());
    for order in orders {
        let drawables: Vec<&MeshInstance> = order.iter().map(|&i| &quads[i]).collect();
        let image = render(&mut kbuffer, &drawables, Color::WHITE);
        // The volume ends at the wall: thickness 1 of 4.
        for (x, y) in [(0, 0), (32, 32), (50, 9)] {
            let c = image.pixel(x, y).unwrap();
            assert_relative_eq!(c.r, 0.5, epsilon = 1e-4);
            assert_relative_eq!(c.g, 0.125, epsilon = 1e-4);
            assert_relative_eq!(c.b, 0.0, epsilon = 1e-4);
            assert_relative_eq!(c.a, 1.0, epsilon = 1e-4);
        }
    }
}

#[test]
fn opaque_surfaces_reject_fragments_behind_them() {
    let registry = MaterialRegistry::new();
    let wall = full_quad(StorePassMaterial::new(&registry).base_color(Color::RED), -2.0);
    let hidden = full_quad(
        StorePassMaterial::new(&registry).base_color(Color::BLUE.with_alpha(0.5)),
        -5.0,
    );

    let mut kbuffer = KBuffer::new(SIZE, SIZE, 4);
    render(&mut kbuffer, &[&wall, &hidden], Color::WHITE);
    assert_eq!(kbuffer.occupancy(9, 9), Some(1));
    assert_eq!(kbuffer.stats().fragments_occluded, 64 * 64);

    kbuffer.set_depth_test(false);
    render(&mut kbuffer, &[&wall, &hidden], Color::WHITE);
    assert_eq!(kbuffer.occupancy(9, 9), Some(2));
}

#[test]
fn tone_mapping_and_gamma_apply_to_covered_pixels_only() {
    let registry = MaterialRegistry::new();
    let half = Viewport::new(0, 0, SIZE / 2, SIZE);
    let quad = MeshInstance::new(
        "left",
        MeshData::quad(1.0, 2.0),
        StorePassMaterial::new(&registry).base_color(Color::rgb(0.5, 0.5, 0.5)),
    )
    .with_transform(Transform::from_position(Vec3::new(-0.5, 0.0, -3.0)));

    let mut kbuffer = KBuffer::new(SIZE, SIZE, 4);
    kbuffer.set_tone_mapped(true);
    kbuffer.set_exposure(2.0);
    kbuffer.set_gamma_corrected(true);
    kbuffer.set_gamma(2.0);

    let cam = camera();
    let mut target = ImageTarget::new(SIZE, SIZE);
    kbuffer.clear_pass();
    kbuffer.draw(&quad, Some(&cam));
    kbuffer.resolve(&mut target, true, Color::rgb(0.5, 0.5, 0.5), Some(&cam.viewport(half)));

    let expected = (1.0 - (-0.5f32 * 2.0).exp()).sqrt();
    assert_relative_eq!(target.pixel(10, 10).unwrap().r, expected, epsilon = 1e-5);
    // Right half lies outside the resolve viewport and keeps the cleared color.
    assert_eq!(target.pixel(50, 10), Some(Color::rgb(0.5, 0.5, 0.5)));
}

#[test]
fn headless_snapshot_writes_a_png() {
    let path = std::env::temp_dir().join(format!("kbuffer-snapshot-{}.png", std::process::id()));
    let config = KBufferConfig {
        depth_test: false,
        ..KBufferConfig::new(40, 30, 8)
    };
    let stats = render_snapshot(&SceneConfig::default(), &config, 10, &path).unwrap();
    assert_eq!(stats.draws, 3);

    let image = image::open(&path).unwrap();
    assert_eq!((image.width(), image.height()), (40, 30));
    let _ = std::fs::remove_file(&path);
}
