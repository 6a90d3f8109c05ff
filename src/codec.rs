// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec-specific syntax consumed by the reference managers.

pub mod av1;
