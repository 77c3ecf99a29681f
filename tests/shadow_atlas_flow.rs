use umbra::{Light, LightKind, LightTable, LightingParams, ShadowAtlas, ShadowUpdateMode};

fn shadow_spot(screen_size: f32) -> Light {
    let mut light = Light::new(LightKind::Spot);
    light.cast_shadows = true;
    light.visible_this_frame = true;
    light.screen_size = screen_size;
    light
}

fn params(split: Option<Vec<u32>>) -> LightingParams {
    LightingParams { shadow_atlas_resolution: 1024, atlas_split: split, ..LightingParams::default() }
}

#[test]
fn assignments_survive_across_frames_until_the_layout_changes() {
    let mut atlas = ShadowAtlas::new();
    let mut lights = LightTable::new();
    let ids: Vec<_> = (0..4).map(|i| lights.add(shadow_spot(40.0 - i as f32))).collect();
    let mut config = params(Some(vec![2]));

    atlas.update(&mut lights, &config);
    let first: Vec<_> = ids.iter().map(|id| lights.get(*id).unwrap().atlas_slot_index).collect();

    // Ten quiet frames: nothing moves, nothing re-renders.
    for _ in 0..10 {
        let stats = atlas.update(&mut lights, &config);
        assert_eq!(stats.reassigned, 0);
    }
    let stable: Vec<_> = ids.iter().map(|id| lights.get(*id).unwrap().atlas_slot_index).collect();
    assert_eq!(first, stable);

    // A split change invalidates everything at once.
    config.atlas_split = Some(vec![3]);
    let stats = atlas.update(&mut lights, &config);
    assert_eq!(stats.reassigned, 4);
    for id in &ids {
        assert!(lights.get(*id).unwrap().atlas_slot_updated);
    }
}

#[test]
fn a_new_bright_light_displaces_only_what_it_must() {
    let mut atlas = ShadowAtlas::new();
    let mut lights = LightTable::new();
    let a = lights.add(shadow_spot(30.0));
    let b = lights.add(shadow_spot(20.0));
    let config = params(Some(vec![2]));
    atlas.update(&mut lights, &config);
    let slot_a = lights.get(a).unwrap().atlas_slot_index;
    let slot_b = lights.get(b).unwrap().atlas_slot_index;

    // Equal slot sizes: existing assignments pass the stability check even
    // though the newcomer outranks them, so only the newcomer is placed.
    let c = lights.add(shadow_spot(99.0));
    let stats = atlas.update(&mut lights, &config);
    assert_eq!(stats.reassigned, 1);
    assert_eq!(lights.get(a).unwrap().atlas_slot_index, slot_a);
    assert_eq!(lights.get(b).unwrap().atlas_slot_index, slot_b);
    assert!(lights.get(c).unwrap().atlas_viewport_allocated);
    assert!(lights.get(c).unwrap().atlas_slot_updated);
}

#[test]
fn starved_light_recovers_when_capacity_frees_up() {
    let mut atlas = ShadowAtlas::new();
    let mut lights = LightTable::new();
    let winner = lights.add(shadow_spot(10.0));
    let loser = lights.add(shadow_spot(1.0));
    let config = params(Some(vec![1]));

    let stats = atlas.update(&mut lights, &config);
    assert_eq!(stats.starved, 1);
    assert!(!lights.get(loser).unwrap().atlas_viewport_allocated);

    lights.get_mut(winner).unwrap().visible_this_frame = false;
    let stats = atlas.update(&mut lights, &config);
    assert_eq!(stats.starved, 0);
    assert!(lights.get(loser).unwrap().atlas_viewport_allocated);
}

#[test]
fn automatic_split_grows_with_the_light_count() {
    let mut atlas = ShadowAtlas::new();
    let mut lights = LightTable::new();
    lights.add(shadow_spot(5.0));
    let config = params(None);
    atlas.update(&mut lights, &config);
    assert_eq!(atlas.slots().len(), 1);

    for i in 0..4 {
        lights.add(shadow_spot(4.0 - i as f32));
    }
    let stats = atlas.update(&mut lights, &config);
    // Five lights force a 3x3 grid; everyone fits, nobody starves.
    assert_eq!(atlas.slots().len(), 9);
    assert_eq!(stats.assigned, 5);
    assert_eq!(stats.starved, 0);
}

#[test]
fn empty_split_list_stays_stable_across_frames() {
    let mut atlas = ShadowAtlas::new();
    let mut lights = LightTable::new();
    let id = lights.add(shadow_spot(5.0));
    let config = params(Some(vec![]));

    atlas.update(&mut lights, &config);
    let version = atlas.version();
    // An empty list behaves like no list at all: the derived layout is
    // unchanged, so nothing regenerates or re-renders.
    let stats = atlas.update(&mut lights, &config);
    assert_eq!(atlas.version(), version);
    assert_eq!(stats.reassigned, 0);
    assert!(!lights.get(id).unwrap().atlas_slot_updated);
    assert!(lights.get(id).unwrap().atlas_viewport_allocated);
}

#[test]
fn disabling_shadows_releases_every_slot() {
    let mut atlas = ShadowAtlas::new();
    let mut lights = LightTable::new();
    let id = lights.add(shadow_spot(5.0));
    let mut config = params(Some(vec![2]));
    atlas.update(&mut lights, &config);
    assert!(lights.get(id).unwrap().atlas_viewport_allocated);

    config.shadows_enabled = false;
    let stats = atlas.update(&mut lights, &config);
    assert_eq!(stats.collected, 0);
    assert!(!lights.get(id).unwrap().atlas_viewport_allocated);
}

#[test]
fn cookie_only_light_still_receives_a_slot() {
    let mut atlas = ShadowAtlas::new();
    let mut lights = LightTable::new();
    let mut light = Light::new(LightKind::Spot);
    light.cookie = true;
    light.visible_this_frame = true;
    light.screen_size = 5.0;
    let id = lights.add(light);

    let stats = atlas.update(&mut lights, &params(Some(vec![1])));
    assert_eq!(stats.assigned, 1);
    assert!(lights.get(id).unwrap().atlas_viewport_allocated);
    assert!(atlas.cookie_resolution() > 0);
}

#[test]
fn update_mode_once_renders_again_only_after_its_slot_moves() {
    let mut atlas = ShadowAtlas::new();
    let mut lights = LightTable::new();
    let mut light = shadow_spot(5.0);
    light.shadow_update_mode = ShadowUpdateMode::Once;
    let id = lights.add(light);
    let mut config = params(Some(vec![1]));

    atlas.update(&mut lights, &config);
    assert!(lights.get(id).unwrap().needs_shadow_rendering());
    lights.get_mut(id).unwrap().shadow_rendered = true;

    atlas.update(&mut lights, &config);
    assert!(!lights.get(id).unwrap().needs_shadow_rendering());

    config.shadow_atlas_resolution = 2048;
    atlas.update(&mut lights, &config);
    assert!(lights.get(id).unwrap().needs_shadow_rendering());
}
