mod helpers;
mod pantry;
mod recipe;
mod shopping;
mod sync;

pub(crate) use pantry::{cmd_pantry_add, cmd_pantry_list, cmd_pantry_remove};
pub(crate) use recipe::{
    ImportOptions, cmd_recipe_import, cmd_recipe_list, cmd_recipe_publish, cmd_recipe_show,
};
pub(crate) use shopping::{
    cmd_import_recipe, cmd_item_add, cmd_item_check, cmd_list_all, cmd_list_complete,
    cmd_list_create, cmd_list_show,
};
pub(crate) use sync::{cmd_changes, cmd_erase, cmd_push};
