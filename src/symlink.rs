//! Symlink handles.

use std::{marker::PhantomData, rc::Rc};

use crate::{image::VaFs, tree::SymlinkNode};

/// Handle to one symbolic link.
pub struct SymlinkHandle<'v> {
    link: Rc<SymlinkNode>,
    _image: PhantomData<&'v VaFs>,
}

impl<'v> SymlinkHandle<'v> {
    pub(crate) fn new(_image: &'v VaFs, link: Rc<SymlinkNode>) -> Self {
        Self {
            link,
            _image: PhantomData,
        }
    }

    /// The raw target string, exactly as stored in the image.
    pub fn target(&self) -> &str {
        &self.link.target
    }
}
